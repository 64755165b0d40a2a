//! Server address resolution.
//!
//! The client resolves the server's host name again before every connect,
//! because a laptop moving between networks may see a different address each
//! time.  Resolution sits behind [`AddressResolver`] so tests can hand the
//! client a fixed list of addresses instead of asking DNS.

use std::net::SocketAddr;

use kvm_core::net::{NetworkAddress, SocketError};
use tracing::debug;

/// Turns a host name and port into socket addresses.
#[cfg_attr(test, mockall::automock)]
pub trait AddressResolver: Send + Sync {
    /// Every address the server may be reached at, in preference order.
    ///
    /// # Errors
    ///
    /// [`SocketError::Resolve`] or [`SocketError::NoAddress`] when the host
    /// cannot be resolved.
    fn resolve(&self, address: &NetworkAddress) -> Result<Vec<SocketAddr>, SocketError>;
}

/// Resolves through the operating system's name service.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

impl AddressResolver for DnsResolver {
    fn resolve(&self, address: &NetworkAddress) -> Result<Vec<SocketAddr>, SocketError> {
        let addrs = address.resolve()?;
        debug!("{address} resolved to {} addresses", addrs.len());
        Ok(addrs)
    }
}

/// Always answers with the same addresses, whatever the host.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    addrs: Vec<SocketAddr>,
}

impl StaticResolver {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }
}

impl AddressResolver for StaticResolver {
    fn resolve(&self, address: &NetworkAddress) -> Result<Vec<SocketAddr>, SocketError> {
        if self.addrs.is_empty() {
            return Err(SocketError::NoAddress {
                host: address.host().to_string(),
            });
        }
        Ok(self.addrs.clone())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
