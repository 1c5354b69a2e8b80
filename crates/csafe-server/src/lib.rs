//! # csafe-server — Reactor and request machinery
//!
//! One thread, one `EventBroker`, every socket non-blocking.
//!
//! ```text
//! Server::run_once
//!   ├─ arm listeners while Admission has room
//!   ├─ broker.wait(poll_timeout)
//!   ├─ accept / dispatch readiness ──► Connection ──► Exchange ──► Service
//!   │                                                   │ bd_action
//!   │                                                   ▼
//!   │                                   spawn ──► BlockClient ──► backend
//!   ├─ route Completions back to their owner by Token
//!   ├─ housekeeping (nonzero poll timeout only)
//!   └─ reap closed pollables, release admission slots
//! ```
//!
//! A pollable that fails is logged, aborted and removed; the loop keeps
//! running. Only `Server::run_once` returning `Err` (the broker itself
//! failing) stops the process.

pub mod net;
pub mod slab;
pub mod exchange;
pub mod connection;
pub mod block_client;
pub mod server;
pub mod signal;
pub mod services;

pub use connection::{Connection, ConnectionFactory};
pub use server::Server;
