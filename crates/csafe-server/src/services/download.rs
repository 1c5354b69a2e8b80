//! `/download`: authenticated file download from the encrypted filesystem.
//!
//! The traversal itself lives in `csafe_fs::Download`; this service only
//! maps its steps onto the suspension protocol. Every block it asks for is
//! a single `bd_action`, so at most one operation is outstanding.

use std::rc::Rc;

use csafe_core::constants::{
    guess_content_type, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, DOWNLOAD_PATH,
};
use csafe_core::error::HttpError;
use csafe_core::pollable::BlockReply;
use csafe_core::service::{BlockAction, BlockIo, Produce, Progress, RequestContext, Service};
use csafe_fs::{Download, FsError, Geometry, Step, UserKey};
use tracing::{debug, warn};

/// Filesystem parameters shared by every download.
#[derive(Debug, Clone, Copy)]
pub struct FsSettings {
    pub geometry: Geometry,
    pub root_blocks: u32,
}

pub struct DownloadService {
    fs: Rc<FsSettings>,
    download: Option<Download>,
}

fn fs_error(e: FsError) -> HttpError {
    match e {
        FsError::NotFound { .. } => HttpError::internal(e.to_string()),
        other => {
            warn!(error = %other, "filesystem error");
            HttpError::internal(other.to_string())
        }
    }
}

impl DownloadService {
    pub fn new(fs: Rc<FsSettings>) -> Self {
        Self { fs, download: None }
    }

    fn download(&mut self) -> Result<&mut Download, HttpError> {
        self.download
            .as_mut()
            .ok_or_else(|| HttpError::internal("download not started"))
    }
}

impl Service for DownloadService {
    fn name(&self) -> &'static str {
        DOWNLOAD_PATH
    }

    fn before_request_content(&mut self, req: &mut RequestContext) -> Result<(), HttpError> {
        let token = req
            .authorization()
            .ok_or_else(|| HttpError::unauthorized("Unauthorized"))?;
        let filename = req
            .query_param("filename")
            .ok_or_else(|| HttpError::internal("File name missing"))?
            .to_string();
        // the name is echoed in Content-Disposition
        if filename.chars().any(char::is_control) {
            return Err(HttpError::internal("Invalid file name"));
        }
        let key = UserKey::derive(token.as_bytes());
        debug!(%filename, "download requested");
        self.download = Some(
            Download::new(key, &filename, self.fs.geometry, self.fs.root_blocks)
                .map_err(fs_error)?,
        );
        Ok(())
    }

    fn before_response_headers(
        &mut self,
        req: &mut RequestContext,
        io: &mut dyn BlockIo,
    ) -> Result<Progress, HttpError> {
        let download = self.download()?;
        match download.poll().map_err(fs_error)? {
            Step::Fetch(block) => {
                io.bd_action(block, BlockAction::Read)?;
                Ok(Progress::Suspend)
            }
            Step::Located { file_size } => {
                let filename = download.filename().to_string();
                req.set_header(CONTENT_LENGTH, file_size.to_string());
                req.set_header(CONTENT_TYPE, guess_content_type(&filename));
                req.set_header(CONTENT_DISPOSITION, format!("attachment; filename={}", filename));
                Ok(Progress::Ready)
            }
            Step::Data(_) | Step::Finished => {
                Err(HttpError::internal("file data before its root entry"))
            }
        }
    }

    fn produce_response(
        &mut self,
        _req: &mut RequestContext,
        io: &mut dyn BlockIo,
    ) -> Result<Produce, HttpError> {
        let download = self.download()?;
        match download.poll().map_err(fs_error)? {
            Step::Fetch(block) => {
                io.bd_action(block, BlockAction::Read)?;
                Ok(Produce::Suspend)
            }
            Step::Data(chunk) => Ok(Produce::Emit(chunk)),
            Step::Finished => Ok(Produce::Done),
            Step::Located { .. } => Err(HttpError::internal("root entry located twice")),
        }
    }

    fn resume(&mut self, _req: &mut RequestContext, reply: BlockReply) -> Result<(), HttpError> {
        let block = reply?;
        self.download()?.resume(block).map_err(fs_error)
    }
}
