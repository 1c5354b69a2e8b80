//! # csafe-fs — Encrypted filesystem layer
//!
//! The on-disk format shared by the frontend (read path) and the client
//! tool (write path). Everything here is pure: blocks go in and out as byte
//! vectors, so the traversal can be tested without a socket.
//!
//! ## Layout
//!
//! ```text
//! root region (blocks 0..root_blocks)
//!   └─ RootEntry { HMAC(user_key, filename), main_block, E(file_size) }
//!        └─ main block:      [u32 BE dir block]*   0 = no pointer
//!             └─ dir block:  [u32 BE data block]*  0 = no pointer
//!                  └─ data block: iv[16] | AES-128-CBC(plaintext | random pad)
//! ```
//!
//! | Module       | Contents                                        |
//! |--------------|-------------------------------------------------|
//! | `key`        | `UserKey` derivation, keyed filename hash       |
//! | `cipher`     | per-block seal / open                           |
//! | `root_entry` | 72-byte root slot, lookup, insertion            |
//! | `layout`     | pointer arrays                                  |
//! | `download`   | `Download` traversal state machine              |
//! | `writer`     | `FileWriter` layout encoder                     |

pub mod error;
pub mod geometry;
pub mod key;
pub mod cipher;
pub mod root_entry;
pub mod layout;
pub mod download;
pub mod writer;

pub use download::{Download, Step};
pub use error::{FsError, Result};
pub use geometry::Geometry;
pub use key::UserKey;
pub use root_entry::RootEntry;
pub use writer::{BlockAllocator, EncodedFile, FileWriter, SequentialAllocator};
