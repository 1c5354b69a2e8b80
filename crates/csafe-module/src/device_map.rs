//! Global block space → (device, local block).
//!
//! Devices are concatenated in configuration order: device `k` covers
//! `[Σ blocks<k, Σ blocks≤k)`.

use csafe_core::config::DeviceConfig;

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceMapError {
    #[error("cannot resolve device {name}: {source}")]
    Resolve { name: String, source: io::Error },
    #[error("device {0} resolves to no address")]
    NoAddress(String),
    #[error("global block space exceeds 32 bits")]
    Overflow,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub addr: SocketAddr,
    pub first_block: u32,
    pub blocks: u32,
    /// `Authorization` header value sent with every block request.
    pub authorization: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceMap {
    devices: Vec<Device>,
}

impl DeviceMap {
    /// No devices: every lookup fails. Used by the block-device tier.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_config(configs: &[DeviceConfig]) -> Result<Self, DeviceMapError> {
        let mut map = Self::empty();
        for c in configs {
            let addr = (c.address.as_str(), c.port)
                .to_socket_addrs()
                .map_err(|source| DeviceMapError::Resolve {
                    name: c.name.clone(),
                    source,
                })?
                .next()
                .ok_or_else(|| DeviceMapError::NoAddress(c.name.clone()))?;
            map.push(
                c.name.clone(),
                addr,
                c.blocks,
                c.credential.as_ref().map(|cr| cr.header_value()),
            )?;
        }
        Ok(map)
    }

    /// Append a device after the current end of the block space.
    pub fn push(
        &mut self,
        name: String,
        addr: SocketAddr,
        blocks: u32,
        authorization: Option<String>,
    ) -> Result<(), DeviceMapError> {
        let first_block = self.end()?;
        first_block.checked_add(blocks).ok_or(DeviceMapError::Overflow)?;
        self.devices.push(Device {
            name,
            addr,
            first_block,
            blocks,
            authorization,
        });
        Ok(())
    }

    fn end(&self) -> Result<u32, DeviceMapError> {
        match self.devices.last() {
            None => Ok(0),
            Some(d) => d.first_block.checked_add(d.blocks).ok_or(DeviceMapError::Overflow),
        }
    }

    pub fn locate(&self, block: u32) -> Option<(&Device, u32)> {
        self.devices
            .iter()
            .find(|d| block >= d.first_block && block - d.first_block < d.blocks)
            .map(|d| (d, block - d.first_block))
    }

    pub fn total_blocks(&self) -> u64 {
        self.devices.iter().map(|d| d.blocks as u64).sum()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
