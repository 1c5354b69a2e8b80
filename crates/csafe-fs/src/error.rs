use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    /// No root entry matches. Also what a wrong credential produces.
    #[error("File {filename} does not exist")]
    NotFound { filename: String },
    #[error("corrupt filesystem: {0}")]
    Corrupt(String),
    #[error("cipher failure")]
    Cipher,
    #[error("file of {size} bytes exceeds maximum of {max}")]
    FileTooLarge { size: u64, max: u64 },
    #[error("block delivered while none was requested")]
    UnexpectedBlock,
    #[error("block operation still outstanding")]
    Pending,
    #[error("no free root entry")]
    RootFull,
    #[error("no free blocks")]
    NoSpace,
}

pub type Result<T> = std::result::Result<T, FsError>;
