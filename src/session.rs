use crate::commands;
use crate::error::ScopeError;
use crate::transport::{Connector, ResourceAddress, Transport};
use log::{debug, info, warn};
use std::time::Duration;

/// One open connection to the instrument.
///
/// The session exclusively owns its transport. It is created by a successful
/// [`Session::connect`] and consumed by [`Session::close`]; dropping it
/// releases the link without the local-control handoff.
pub struct Session {
    transport: Box<dyn Transport>,
    identity: String,
}

impl Session {
    /// Open a transport and run the connect handshake.
    pub fn connect(
        connector: &mut dyn Connector,
        address: &ResourceAddress,
        timeout: Duration,
    ) -> Result<Self, ScopeError> {
        info!("Opening {address}");
        let transport = connector.open(address, timeout)?;
        Self::open(transport, timeout)
    }

    /// Handshake on an already open transport: default timeout, device
    /// clear, headers off, identity, hardcopy to the remote port.
    pub fn open(mut transport: Box<dyn Transport>, timeout: Duration) -> Result<Self, ScopeError> {
        transport.set_timeout(timeout)?;
        transport.clear()?;

        let mut session = Self {
            transport,
            identity: String::new(),
        };

        session.write(commands::HEADERS_OFF)?;
        session.identity = session.query(commands::IDENTITY)?;
        session.write(commands::HARDCOPY_REMOTE)?;

        info!("Connected to {}", session.identity);
        Ok(session)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn write(&mut self, command: &str) -> Result<(), ScopeError> {
        debug!("-> {command}");
        self.transport.write(command.as_bytes())
    }

    pub fn read_raw(&mut self) -> Result<Vec<u8>, ScopeError> {
        let data = self.transport.read_raw()?;
        debug!("<- {} bytes", data.len());
        Ok(data)
    }

    /// Write a query and return its response as trimmed text.
    pub fn query(&mut self, command: &str) -> Result<String, ScopeError> {
        self.write(command)?;
        let raw = self.transport.read_raw()?;
        let text = String::from_utf8_lossy(&raw).trim().to_string();
        debug!("<- {text}");
        Ok(text)
    }

    /// Device clear. Drops a reply that is still in flight, e.g. one that
    /// arrived after its query timed out.
    pub fn clear(&mut self) -> Result<(), ScopeError> {
        debug!("-> device clear");
        self.transport.clear()
    }

    pub fn timeout(&self) -> Duration {
        self.transport.timeout()
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), ScopeError> {
        self.transport.set_timeout(timeout)
    }

    /// Run `op` with a temporary timeout. The previous timeout is restored
    /// whatever `op` returns.
    pub fn with_timeout<T>(
        &mut self,
        timeout: Duration,
        op: impl FnOnce(&mut Self) -> Result<T, ScopeError>,
    ) -> Result<T, ScopeError> {
        let previous = self.timeout();
        self.set_timeout(timeout)?;
        debug!("Timeout raised from {previous:?} to {timeout:?}");

        let result = op(self);

        match self.set_timeout(previous) {
            Ok(()) => result,
            Err(e) => {
                warn!("Failed to restore timeout {previous:?}: {e}");
                // A failed operation is reported over the restore failure.
                result.and(Err(e))
            }
        }
    }

    /// Hand the instrument back to local control and release the link.
    ///
    /// Every step runs even if an earlier one failed; the failures are
    /// returned individually.
    pub fn close(mut self) -> Vec<ScopeError> {
        let mut failures = Vec::new();

        for command in [
            commands::HARDCOPY_PRINT,
            commands::HARDCOPY_AUTOSAVE_OFF,
            commands::GO_TO_LOCAL,
        ] {
            if let Err(e) = self.write(command) {
                warn!("Restore step '{command}' failed: {e}");
                failures.push(ScopeError::partial(format!("restore {command}"), e));
            }
        }

        if let Err(e) = self.transport.close() {
            warn!("Closing transport failed: {e}");
            failures.push(ScopeError::partial("close", e));
        }

        info!("Session closed ({} cleanup failures)", failures.len());
        failures
    }

    /// Release the link without talking to the instrument, after the link
    /// itself has failed.
    pub fn abandon(mut self) {
        if let Err(e) = self.transport.close() {
            debug!("Ignoring close failure on abandoned link: {e}");
        }
    }
}
