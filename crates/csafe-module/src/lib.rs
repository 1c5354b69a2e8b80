//! # csafe-module — Default (safe) implementations
//!
//! This crate provides the default implementation for every csafe trait
//! plus the small owned components the reactor and services share.
//! Each impl prioritizes correctness and simplicity over performance.
//!
//! ## Default stack
//!
//! | Trait / concern | Default Impl      | Alternative              |
//! |-----------------|-------------------|--------------------------|
//! | EventBroker     | PollBroker        | SelectBroker (fallback)  |
//! | Admission       | Admission counter | —                        |
//! | Block storage   | BlockStore        | —                        |
//! | Block routing   | DeviceMap         | —                        |
//! | Path dispatch   | ServiceRegistry   | —                        |

pub mod poll_broker;
pub mod select_broker;
pub mod admission;
pub mod block_store;
pub mod device_map;
pub mod registry;

use csafe_core::broker::EventBroker;
use csafe_core::config::EventMethod;

/// Build the broker selected by configuration.
pub fn new_broker(method: EventMethod) -> Box<dyn EventBroker> {
    match method {
        EventMethod::Poll => Box::new(poll_broker::PollBroker::new()),
        EventMethod::Select => Box::new(select_broker::SelectBroker::new()),
    }
}
