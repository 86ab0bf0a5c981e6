//! Instrument links.
//!
//! A [`Transport`] moves raw bytes to and from the oscilloscope. Two network
//! flavours are provided: LeCroy's VICP framing (the default for `::INSTR`
//! resources) and a plain newline-terminated SCPI socket. Resource strings use
//! the VISA shape `<protocol>::<host>::INSTR` or `TCPIP::<host>::<port>::SOCKET`.

use crate::error::ScopeError;
use log::{debug, warn};
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

pub mod socket;
pub mod vicp;

#[cfg(test)]
pub(crate) mod mock;

pub use socket::SocketTransport;
pub use vicp::{VicpTransport, VICP_PORT};

/// Largest response accepted from the instrument before the link is
/// considered out of sync.
pub const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// Byte-level access to one instrument connection.
pub trait Transport: Send {
    /// Send one complete message.
    fn write(&mut self, data: &[u8]) -> Result<(), ScopeError>;

    /// Read one complete response, up to the active timeout.
    fn read_raw(&mut self) -> Result<Vec<u8>, ScopeError>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ScopeError>;

    fn timeout(&self) -> Duration;

    /// Device clear: drop any stale input/output held by the instrument.
    fn clear(&mut self) -> Result<(), ScopeError>;

    fn close(&mut self) -> Result<(), ScopeError>;
}

/// Parsed instrument resource string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    /// `TCPIP::<host>::INSTR` or `VICP::<host>::INSTR`
    Vicp { host: String, port: u16 },
    /// `TCPIP::<host>::<port>::SOCKET`
    Socket { host: String, port: u16 },
}

impl ResourceAddress {
    /// Parse a resource string. A bare host name or IP is accepted and treated
    /// as `TCPIP::<host>::INSTR`.
    pub fn parse(resource: &str) -> Result<Self, ScopeError> {
        let resource = resource.trim();
        if resource.is_empty() {
            return Err(ScopeError::InvalidAddress("empty resource string".to_string()));
        }

        if !resource.contains("::") {
            return Ok(ResourceAddress::Vicp {
                host: resource.to_string(),
                port: VICP_PORT,
            });
        }

        let parts: Vec<&str> = resource.split("::").map(str::trim).collect();
        let protocol = parts[0].to_ascii_uppercase();
        let network = protocol.starts_with("TCPIP") || protocol.starts_with("VICP");

        match parts.as_slice() {
            [_, host, kind] if network && kind.eq_ignore_ascii_case("INSTR") && !host.is_empty() => {
                Ok(ResourceAddress::Vicp {
                    host: host.to_string(),
                    port: VICP_PORT,
                })
            }
            [_, host, port, kind]
                if protocol.starts_with("TCPIP")
                    && kind.eq_ignore_ascii_case("SOCKET")
                    && !host.is_empty() =>
            {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ScopeError::InvalidAddress(format!("bad port in {resource}")))?;
                Ok(ResourceAddress::Socket {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(ScopeError::InvalidAddress(resource.to_string())),
        }
    }

    pub fn host(&self) -> &str {
        match self {
            ResourceAddress::Vicp { host, .. } | ResourceAddress::Socket { host, .. } => host,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ResourceAddress::Vicp { port, .. } | ResourceAddress::Socket { port, .. } => *port,
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAddress::Vicp { host, .. } => write!(f, "TCPIP::{host}::INSTR"),
            ResourceAddress::Socket { host, port } => write!(f, "TCPIP::{host}::{port}::SOCKET"),
        }
    }
}

/// Opens transports for the worker. Tests substitute an in-memory link here.
pub trait Connector: Send {
    fn open(
        &mut self,
        address: &ResourceAddress,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, ScopeError>;
}

/// Connects over TCP.
#[derive(Debug, Clone)]
pub struct NetworkConnector {
    pub connect_timeout: Duration,
}

impl Default for NetworkConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl NetworkConnector {
    fn connect_stream(&self, address: &ResourceAddress) -> Result<TcpStream, ScopeError> {
        let target = format!("{}:{}", address.host(), address.port());
        let socket_addr = target
            .to_socket_addrs()
            .map_err(|_| ScopeError::InvalidAddress(address.to_string()))?
            .next()
            .ok_or_else(|| ScopeError::InvalidAddress(address.to_string()))?;

        debug!("Connecting to {address} ({socket_addr})");

        let stream = TcpStream::connect_timeout(&socket_addr, self.connect_timeout).map_err(|e| {
            warn!("Failed to connect to {address}: {e}");
            ScopeError::link(e, format!("Failed to connect to {address}"))
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {address}: {e}");
        }

        Ok(stream)
    }
}

impl Connector for NetworkConnector {
    fn open(
        &mut self,
        address: &ResourceAddress,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, ScopeError> {
        let stream = self.connect_stream(address)?;
        match address {
            ResourceAddress::Vicp { .. } => Ok(Box::new(VicpTransport::new(stream, timeout)?)),
            ResourceAddress::Socket { .. } => Ok(Box::new(SocketTransport::new(stream, timeout)?)),
        }
    }
}

/// Apply the same timeout to both directions of a TCP stream.
pub(crate) fn apply_stream_timeout(stream: &TcpStream, timeout: Duration) -> Result<(), ScopeError> {
    // A zero duration is rejected by the socket API.
    let timeout = Some(timeout.max(Duration::from_millis(1)));
    stream
        .set_read_timeout(timeout)
        .map_err(|e| ScopeError::link(e, "Setting read timeout"))?;
    stream
        .set_write_timeout(timeout)
        .map_err(|e| ScopeError::link(e, "Setting write timeout"))?;
    Ok(())
}
