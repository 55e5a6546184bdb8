//! First-free-port scan over `[base, base + range]`.
//!
//! The scan is advisory: the port is released again before the container
//! runtime binds it, so another process can take it in between. That is
//! acceptable for a developer machine and not meant for contended hosts.

use common::{Config, Error, Result};
use std::net::TcpListener;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    base: u16,
    range: u16,
}

impl PortAllocator {
    pub fn new(base: u16, range: u16) -> Self {
        Self { base, range }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.base_port, config.port_range)
    }

    /// Lowest port in the range nothing is listening on.
    pub fn allocate(&self) -> Result<u16> {
        allocate(self.base, self.range)
    }
}

pub fn allocate(base: u16, range: u16) -> Result<u16> {
    let last = (u32::from(base) + u32::from(range)).min(u32::from(u16::MAX)) as u16;
    for port in base..=last {
        if port != 0 && is_free(port) {
            debug!(port, "allocated port");
            return Ok(port);
        }
    }
    Err(Error::NoPortAvailable { base, range })
}

/// Whether both loopback and wildcard binds succeed. Published container
/// ports bind the wildcard address, local dev servers often only loopback.
pub fn is_free(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => drop(listener),
        Err(_) => return false,
    }
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}
