//! # csafe-core — Trait definitions for csafe
//!
//! This crate defines the trait boundaries for every axis of variability
//! in the encrypted block storage system. Each trait models one capability
//! dimension; default implementations live in `csafe-module`, and the
//! reactor that ties them together lives in `csafe-server`.
//!
//! | Trait / type    | Role                                                |
//! |-----------------|-----------------------------------------------------|
//! | `EventBroker`   | readiness multiplexing (poll / select)              |
//! | `Pollable`      | anything the reactor drives: connections, clients   |
//! | `Service`       | per-path, suspendable request handler               |
//! | `BlockIo`       | the bd_action seam a service uses to fetch blocks   |
//!
//! Nothing in this crate owns a socket. Everything here can be exercised
//! from unit tests without a live reactor.

pub mod constants;
pub mod error;
pub mod env;
pub mod config;
pub mod broker;
pub mod pollable;
pub mod service;
pub mod http;
