//! Host/port addresses that resolve to one or more socket addresses.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use super::SocketError;

/// Port used when an address string carries none.
pub const DEFAULT_PORT: u16 = 24800;

/// A hostname (or IP literal) plus port.
///
/// Resolution is deferred to [`NetworkAddress::resolve`] so that a client can
/// re-resolve on every connection attempt and follow DNS changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    host: String,
    port: u16,
}

impl NetworkAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host`, `host:port`, `[v6]`, or `[v6]:port`.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::InvalidAddress`] for an empty host or a port
    /// that is not a number in `1..=65535`.
    pub fn parse(text: &str, default_port: u16) -> Result<Self, SocketError> {
        let invalid = || SocketError::InvalidAddress {
            address: text.to_string(),
        };
        let text = text.trim();

        let (host, port) = if let Some(rest) = text.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid()),
            }
        } else {
            match text.rsplit_once(':') {
                // More than one colon without brackets: a bare IPv6 literal.
                Some((host, _)) if host.contains(':') => (text, None),
                Some((host, port)) => (host, Some(port)),
                None => (text, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|&port| port != 0)
                .ok_or_else(invalid)?,
            None => default_port,
        };
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves to every address the host maps to.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Resolve`] if the lookup fails and
    /// [`SocketError::NoAddress`] if it succeeds with no results.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, SocketError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| SocketError::Resolve {
                host: self.host.clone(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(SocketError::NoAddress {
                host: self.host.clone(),
            });
        }
        Ok(addrs)
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
