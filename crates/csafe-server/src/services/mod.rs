//! Concrete services and the registries for each tier.

mod block_device;
mod download;

use std::rc::Rc;

use csafe_core::constants::{DOWNLOAD_PATH, READ_PATH, WRITE_PATH};
use csafe_module::registry::ServiceRegistry;

pub use block_device::{BlockDevice, ReadBlock, WriteBlock};
pub use download::{DownloadService, FsSettings};

/// `/read` and `/write` over one backing store.
pub fn block_device_registry(device: Rc<BlockDevice>) -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    let read = device.clone();
    registry.register(READ_PATH, move || Box::new(ReadBlock::new(read.clone())));
    registry.register(WRITE_PATH, move || Box::new(WriteBlock::new(device.clone())));
    registry
}

/// `/download` over the encrypted filesystem.
pub fn frontend_registry(fs: Rc<FsSettings>) -> ServiceRegistry {
    let mut registry = ServiceRegistry::new();
    registry.register(DOWNLOAD_PATH, move || Box::new(DownloadService::new(fs.clone())));
    registry
}
