//! `/read` and `/write`: raw block access on the backend tier.

use std::rc::Rc;

use csafe_core::constants::{AUTHORIZATION, CONTENT_LENGTH, READ_PATH, WRITE_PATH};
use csafe_core::error::HttpError;
use csafe_core::service::{BlockIo, Produce, Progress, RequestContext, Service};
use csafe_module::block_store::{BlockStore, StoreError};
use tracing::debug;

/// The backing store plus the credential guarding it.
#[derive(Debug)]
pub struct BlockDevice {
    store: BlockStore,
    /// Expected `Authorization` value (`username:password`).
    authorization: Option<String>,
}

impl BlockDevice {
    pub fn new(store: BlockStore, authorization: Option<String>) -> Self {
        Self { store, authorization }
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    fn authorize(&self, req: &RequestContext) -> Result<(), HttpError> {
        match &self.authorization {
            None => Ok(()),
            Some(expected) if req.headers.get(AUTHORIZATION) == Some(expected.as_str()) => Ok(()),
            Some(_) => Err(HttpError::unauthorized("Unauthorized")),
        }
    }
}

fn block_param(req: &RequestContext) -> Result<u32, HttpError> {
    let raw = req
        .query_param("block")
        .ok_or_else(|| HttpError::internal("block number missing"))?;
    raw.parse()
        .map_err(|_| HttpError::internal(format!("invalid block number {}", raw)))
}

fn store_error(e: StoreError) -> HttpError {
    HttpError::internal(e.to_string())
}

pub struct ReadBlock {
    device: Rc<BlockDevice>,
    block: Option<u32>,
    data: Option<Vec<u8>>,
}

impl ReadBlock {
    pub fn new(device: Rc<BlockDevice>) -> Self {
        Self {
            device,
            block: None,
            data: None,
        }
    }
}

impl Service for ReadBlock {
    fn name(&self) -> &'static str {
        READ_PATH
    }

    fn before_request_content(&mut self, req: &mut RequestContext) -> Result<(), HttpError> {
        self.device.authorize(req)?;
        self.block = Some(block_param(req)?);
        Ok(())
    }

    fn before_response_headers(
        &mut self,
        req: &mut RequestContext,
        _io: &mut dyn BlockIo,
    ) -> Result<Progress, HttpError> {
        let block = self
            .block
            .ok_or_else(|| HttpError::internal("block number missing"))?;
        let data = self.device.store.read_block(block).map_err(store_error)?;
        req.set_header(CONTENT_LENGTH, data.len().to_string());
        self.data = Some(data);
        Ok(Progress::Ready)
    }

    fn produce_response(
        &mut self,
        _req: &mut RequestContext,
        _io: &mut dyn BlockIo,
    ) -> Result<Produce, HttpError> {
        Ok(match self.data.take() {
            Some(data) => Produce::Emit(data),
            None => Produce::Done,
        })
    }
}

pub struct WriteBlock {
    device: Rc<BlockDevice>,
    block: Option<u32>,
}

impl WriteBlock {
    pub fn new(device: Rc<BlockDevice>) -> Self {
        Self { device, block: None }
    }
}

impl Service for WriteBlock {
    fn name(&self) -> &'static str {
        WRITE_PATH
    }

    fn before_request_content(&mut self, req: &mut RequestContext) -> Result<(), HttpError> {
        self.device.authorize(req)?;
        self.block = Some(block_param(req)?);
        Ok(())
    }

    fn max_content_length(&self) -> usize {
        self.device.store.block_size()
    }

    fn before_response_headers(
        &mut self,
        req: &mut RequestContext,
        _io: &mut dyn BlockIo,
    ) -> Result<Progress, HttpError> {
        let block = self
            .block
            .ok_or_else(|| HttpError::internal("block number missing"))?;
        self.device
            .store
            .write_block(block, &req.content)
            .map_err(store_error)?;
        debug!(block, len = req.content.len(), "block stored");
        req.set_header(CONTENT_LENGTH, "0");
        Ok(Progress::Ready)
    }

    fn produce_response(
        &mut self,
        _req: &mut RequestContext,
        _io: &mut dyn BlockIo,
    ) -> Result<Produce, HttpError> {
        Ok(Produce::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csafe_core::http::{parse_query, Headers};
    use csafe_core::service::BlockAction;

    struct NoIo;

    impl BlockIo for NoIo {
        fn bd_action(&mut self, _: u32, _: BlockAction) -> Result<(), HttpError> {
            panic!("block device services never suspend");
        }
    }

    fn device(auth: Option<&str>) -> (tempfile::TempDir, Rc<BlockDevice>) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(&dir.path().join("d"), 4, 128).unwrap();
        (dir, Rc::new(BlockDevice::new(store, auth.map(str::to_string))))
    }

    fn request(path: &str, query: &str, auth: Option<&str>) -> RequestContext {
        let mut headers = Headers::new();
        if let Some(a) = auth {
            headers.insert(AUTHORIZATION, a);
        }
        RequestContext::new("GET".into(), path.into(), parse_query(query), headers)
    }

    #[test]
    fn write_then_read() {
        let (_dir, dev) = device(None);
        let mut w = WriteBlock::new(dev.clone());
        let mut req = request(WRITE_PATH, "block=2", None);
        w.before_request_content(&mut req).unwrap();
        w.handle_content(&mut req, b"abc").unwrap();
        assert_eq!(w.before_response_headers(&mut req, &mut NoIo).unwrap(), Progress::Ready);
        assert_eq!(w.produce_response(&mut req, &mut NoIo).unwrap(), Produce::Done);

        let mut r = ReadBlock::new(dev);
        let mut req = request(READ_PATH, "block=2", None);
        r.before_request_content(&mut req).unwrap();
        r.before_response_headers(&mut req, &mut NoIo).unwrap();
        assert_eq!(req.response_header(CONTENT_LENGTH), Some("128"));
        match r.produce_response(&mut req, &mut NoIo).unwrap() {
            Produce::Emit(data) => {
                assert_eq!(&data[..3], b"abc");
                assert_eq!(data.len(), 128);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(r.produce_response(&mut req, &mut NoIo).unwrap(), Produce::Done);
    }

    #[test]
    fn credential_and_parameters() {
        let (_dir, dev) = device(Some("u:p"));
        let mut r = ReadBlock::new(dev.clone());
        let err = r
            .before_request_content(&mut request(READ_PATH, "block=1", Some("u:x")))
            .unwrap_err();
        assert_eq!(err.code, 401);
        assert!(r
            .before_request_content(&mut request(READ_PATH, "block=1", Some("u:p")))
            .is_ok());

        let mut r = ReadBlock::new(dev);
        let err = r
            .before_request_content(&mut request(READ_PATH, "block=x", Some("u:p")))
            .unwrap_err();
        assert_eq!(err.code, 500);
    }
}
