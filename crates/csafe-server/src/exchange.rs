//! `Exchange` — drives one request's `Service` through its hooks.
//!
//! Socket-free: the connection feeds it request content and block
//! completions, and turns its `Output` into bytes on the wire.
//!
//! **Invariant:** after a hook returns a suspension, the exchange holds
//! exactly one pending `OpId`. `drive()` does not call into the service
//! again until `complete()` has delivered that op's reply. Replies for any
//! other op are ignored.

use csafe_core::error::HttpError;
use csafe_core::pollable::{BlockReply, OpId};
use csafe_core::service::{BlockAction, BlockIo, Produce, Progress, RequestContext, Service};

use tracing::trace;

/// Where block operations issued by a service go.
pub trait BlockSubmit {
    fn submit(&mut self, op: OpId, block_num: u32, action: BlockAction) -> Result<(), HttpError>;
}

/// What the connection should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Status and response headers are final.
    Head,
    Body(Vec<u8>),
    /// Waiting for a block completion.
    Suspended,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Headers,
    Body,
    Done,
}

pub struct Exchange {
    service: Box<dyn Service>,
    req: RequestContext,
    stage: Stage,
    next_op: OpId,
    pending: Option<OpId>,
}

/// `BlockIo` handed to a hook: admits one operation, tagged with `op`.
struct Issuer<'a> {
    submit: &'a mut dyn BlockSubmit,
    op: OpId,
    issued: bool,
}

impl BlockIo for Issuer<'_> {
    fn bd_action(&mut self, block_num: u32, action: BlockAction) -> Result<(), HttpError> {
        if self.issued {
            return Err(HttpError::internal("one block operation per suspension"));
        }
        self.submit.submit(self.op, block_num, action)?;
        self.issued = true;
        Ok(())
    }
}

impl Exchange {
    pub fn new(service: Box<dyn Service>, req: RequestContext) -> Self {
        Self {
            service,
            req,
            stage: Stage::Headers,
            next_op: 1,
            pending: None,
        }
    }

    pub fn request(&self) -> &RequestContext {
        &self.req
    }

    pub fn service_name(&self) -> &'static str {
        self.service.name()
    }

    pub fn is_suspended(&self) -> bool {
        self.pending.is_some()
    }

    pub fn headers_done(&self) -> bool {
        self.stage != Stage::Headers
    }

    pub fn begin(&mut self) -> Result<(), HttpError> {
        self.service.before_request_content(&mut self.req)
    }

    pub fn max_content_length(&self) -> usize {
        self.service.max_content_length()
    }

    pub fn content(&mut self, chunk: &[u8]) -> Result<(), HttpError> {
        self.service.handle_content(&mut self.req, chunk)
    }

    /// Advance by one hook call.
    pub fn drive(&mut self, submit: &mut dyn BlockSubmit) -> Result<Output, HttpError> {
        if self.pending.is_some() {
            return Ok(Output::Suspended);
        }
        let op = self.next_op;
        let mut io = Issuer { submit, op, issued: false };
        let output = match self.stage {
            Stage::Headers => match self.service.before_response_headers(&mut self.req, &mut io)? {
                Progress::Ready => {
                    self.stage = Stage::Body;
                    Output::Head
                }
                Progress::Suspend => Output::Suspended,
            },
            Stage::Body => match self.service.produce_response(&mut self.req, &mut io)? {
                Produce::Emit(chunk) => Output::Body(chunk),
                Produce::Suspend => Output::Suspended,
                Produce::Done => {
                    self.stage = Stage::Done;
                    Output::Finished
                }
            },
            Stage::Done => Output::Finished,
        };
        match (&output, io.issued) {
            (Output::Suspended, true) => {
                trace!(op, service = self.service.name(), "suspended");
                self.pending = Some(op);
                self.next_op += 1;
            }
            (Output::Suspended, false) => {
                return Err(HttpError::internal(format!(
                    "service {} suspended without a block operation",
                    self.service.name()
                )));
            }
            (_, true) => {
                return Err(HttpError::internal(format!(
                    "service {} started a block operation without suspending",
                    self.service.name()
                )));
            }
            (_, false) => {}
        }
        Ok(output)
    }

    /// Deliver a block reply. Returns `Ok(false)` when `op` is not the
    /// pending operation (stale or duplicate) and nothing happened.
    pub fn complete(&mut self, op: OpId, reply: BlockReply) -> Result<bool, HttpError> {
        if self.pending != Some(op) {
            return Ok(false);
        }
        self.pending = None;
        self.service.resume(&mut self.req, reply)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csafe_core::error::BackendError;
    use csafe_core::http::{Headers, Query};
    use std::cell::Cell;
    use std::rc::Rc;

    /// Reads blocks 10, 11, 12 in sequence and emits each.
    struct Chain {
        next: u32,
        have: Option<Vec<u8>>,
        calls: Rc<Cell<usize>>,
    }

    impl Service for Chain {
        fn name(&self) -> &'static str {
            "/chain"
        }

        fn produce_response(
            &mut self,
            _req: &mut RequestContext,
            io: &mut dyn BlockIo,
        ) -> Result<Produce, HttpError> {
            self.calls.set(self.calls.get() + 1);
            if let Some(block) = self.have.take() {
                return Ok(Produce::Emit(block));
            }
            if self.next > 12 {
                return Ok(Produce::Done);
            }
            io.bd_action(self.next, BlockAction::Read)?;
            self.next += 1;
            Ok(Produce::Suspend)
        }

        fn resume(&mut self, _req: &mut RequestContext, reply: BlockReply) -> Result<(), HttpError> {
            self.have = Some(reply?);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        issued: Vec<(OpId, u32)>,
    }

    impl BlockSubmit for Recorder {
        fn submit(&mut self, op: OpId, block_num: u32, _action: BlockAction) -> Result<(), HttpError> {
            self.issued.push((op, block_num));
            Ok(())
        }
    }

    fn exchange(calls: Rc<Cell<usize>>) -> Exchange {
        let req = RequestContext::new("GET".into(), "/chain".into(), Query::new(), Headers::new());
        Exchange::new(Box::new(Chain { next: 10, have: None, calls }), req)
    }

    #[test]
    fn suspended_service_is_resumed_exactly_once() {
        let calls = Rc::new(Cell::new(0));
        let mut ex = exchange(calls.clone());
        let mut rec = Recorder::default();

        assert_eq!(ex.drive(&mut rec).unwrap(), Output::Head);
        assert_eq!(ex.drive(&mut rec).unwrap(), Output::Suspended);
        assert_eq!(calls.get(), 1);

        // no completion yet: the service is not called again
        for _ in 0..5 {
            assert_eq!(ex.drive(&mut rec).unwrap(), Output::Suspended);
        }
        assert_eq!(calls.get(), 1);
        assert_eq!(rec.issued, vec![(1, 10)]);

        // a stale op id is ignored
        assert!(!ex.complete(99, Ok(vec![0])).unwrap());
        assert!(ex.is_suspended());

        assert!(ex.complete(1, Ok(b"ten".to_vec())).unwrap());
        // a duplicate completion for the same op is ignored
        assert!(!ex.complete(1, Ok(b"dup".to_vec())).unwrap());

        assert_eq!(ex.drive(&mut rec).unwrap(), Output::Body(b"ten".to_vec()));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn full_chain_in_order() {
        let calls = Rc::new(Cell::new(0));
        let mut ex = exchange(calls);
        let mut rec = Recorder::default();
        let mut body = Vec::new();
        loop {
            match ex.drive(&mut rec).unwrap() {
                Output::Head => {}
                Output::Body(b) => body.extend(b),
                Output::Suspended => {
                    let (op, block) = *rec.issued.last().unwrap();
                    ex.complete(op, Ok(vec![block as u8])).unwrap();
                }
                Output::Finished => break,
            }
        }
        assert_eq!(body, vec![10, 11, 12]);
        assert_eq!(rec.issued, vec![(1, 10), (2, 11), (3, 12)]);
    }

    #[test]
    fn backend_failure_surfaces_as_http_error() {
        let mut ex = exchange(Rc::new(Cell::new(0)));
        let mut rec = Recorder::default();
        ex.drive(&mut rec).unwrap();
        ex.drive(&mut rec).unwrap();
        let err = ex.complete(1, Err(BackendError::TimedOut)).unwrap_err();
        assert_eq!(err.code, 500);
    }

    struct Greedy;

    impl Service for Greedy {
        fn name(&self) -> &'static str {
            "/greedy"
        }

        fn produce_response(
            &mut self,
            _req: &mut RequestContext,
            io: &mut dyn BlockIo,
        ) -> Result<Produce, HttpError> {
            io.bd_action(1, BlockAction::Read)?;
            io.bd_action(2, BlockAction::Read)?;
            Ok(Produce::Suspend)
        }
    }

    #[test]
    fn second_operation_per_suspension_is_refused() {
        let req = RequestContext::new("GET".into(), "/greedy".into(), Query::new(), Headers::new());
        let mut ex = Exchange::new(Box::new(Greedy), req);
        let mut rec = Recorder::default();
        assert_eq!(ex.drive(&mut rec).unwrap(), Output::Head);
        assert!(ex.drive(&mut rec).is_err());
        assert_eq!(rec.issued.len(), 1);
    }
}
