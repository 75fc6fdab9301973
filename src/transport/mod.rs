//! Field-bus register transport.
//!
//! The acquisition core talks to the temperature controllers through a single
//! register-level contract: read one 16-bit register at one device address, write one
//! register, and open/close/reconnect the physical link. Retry policy is *not* part of
//! the transport: a failed read is returned as-is and the caller (the live sample
//! source) decides when to call [`RegisterTransport::reconnect`].
//!
//! The physical link is shared between the recording loop, the preview loop and the
//! setpoint write path. [`SharedTransport`] serializes access with a mutex that is held
//! for exactly one transaction, so a configuration write waits for at most one register
//! read and never for a whole tick.

pub mod mock;
pub mod modbus_rtu;

pub use mock::{MockCounters, MockTransport};
pub use modbus_rtu::RtuTransport;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Register bank used for reads.
///
/// Selected once at open time and fixed for the lifetime of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Holding registers (function 0x03).
    #[default]
    Holding,
    /// Input registers (function 0x04).
    Input,
}

/// Failure of a single request/response transaction on the wire.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Underlying port I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No complete response within the link timeout.
    #[error("response timed out")]
    Timeout,

    /// The response checksum did not match its content.
    #[error("CRC mismatch (expected {expected:#06x}, got {actual:#06x})")]
    CrcMismatch {
        /// Checksum computed over the received bytes.
        expected: u16,
        /// Checksum carried by the frame.
        actual: u16,
    },

    /// The device answered with a protocol exception.
    #[error("device exception {code:#04x} for function {function:#04x}")]
    Exception {
        /// Function code of the rejected request.
        function: u8,
        /// Exception code reported by the device.
        code: u8,
    },

    /// The response was well-formed but not an answer to our request.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Errors surfaced by a [`RegisterTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The physical link could not be opened.
    #[error("failed to open link on {port}: {reason}")]
    Link {
        /// Port identifier the open was attempted on.
        port: String,
        /// Human-readable cause.
        reason: String,
    },

    /// A transaction was attempted while the link is closed.
    #[error("link is not open")]
    NotConnected,

    /// A single register read failed.
    #[error("read of register {register:#06x} at device {device} failed: {source}")]
    Read {
        /// Device (slave) address.
        device: u8,
        /// Register address.
        register: u16,
        /// Wire-level cause.
        #[source]
        source: FrameError,
    },

    /// A single register write failed.
    #[error("write of register {register:#06x} at device {device} failed: {source}")]
    Write {
        /// Device (slave) address.
        device: u8,
        /// Register address.
        register: u16,
        /// Wire-level cause.
        #[source]
        source: FrameError,
    },

    /// Close-then-open did not bring the link back.
    #[error("reconnect failed: {0}")]
    Reconnect(#[source] Box<TransportError>),
}

impl TransportError {
    /// Whether the link itself is unusable (as opposed to one failed transaction).
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Link { .. } | TransportError::Reconnect(_)
        )
    }
}

/// Register-level access to the field bus.
///
/// Implementations own the physical link. All methods are blocking and bounded by the
/// link's own response timeout.
pub trait RegisterTransport: Send {
    /// Open the link with the parameters the transport was built with.
    ///
    /// Opening an already open transport is a no-op.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Close the link. Closing a closed transport is a no-op.
    fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;

    /// Read one register.
    fn read_register(&mut self, device: u8, register: u16) -> Result<u16, TransportError>;

    /// Write one register.
    fn write_register(
        &mut self,
        device: u8,
        register: u16,
        value: u16,
    ) -> Result<(), TransportError>;

    /// Short description of the link for log messages.
    fn describe(&self) -> String;

    /// Close and re-open with the same parameters.
    fn reconnect(&mut self) -> Result<(), TransportError> {
        if let Err(err) = self.close() {
            warn!(link = %self.describe(), error = %err, "Close before reconnect failed");
        }
        self.open()
            .map_err(|err| TransportError::Reconnect(Box::new(err)))
    }
}

/// Cloneable handle to a transport shared by several workers.
///
/// Every method takes the lock for a single transaction only.
#[derive(Clone)]
pub struct SharedTransport {
    inner: Arc<Mutex<Link>>,
}

struct Link {
    transport: Box<dyn RegisterTransport>,
    leases: usize,
}

impl SharedTransport {
    /// Wrap a transport for shared use.
    pub fn new(transport: Box<dyn RegisterTransport>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Link {
                transport,
                leases: 0,
            })),
        }
    }

    /// Open the link if it is not open yet.
    pub fn open(&self) -> Result<(), TransportError> {
        let mut link = self.inner.lock();
        if link.transport.is_open() {
            return Ok(());
        }
        link.transport.open()
    }

    /// Close the link.
    pub fn close(&self) -> Result<(), TransportError> {
        self.inner.lock().transport.close()
    }

    /// Whether the link is currently open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().transport.is_open()
    }

    /// Read one register.
    pub fn read_register(&self, device: u8, register: u16) -> Result<u16, TransportError> {
        self.inner.lock().transport.read_register(device, register)
    }

    /// Write one register.
    pub fn write_register(
        &self,
        device: u8,
        register: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        self.inner
            .lock()
            .transport
            .write_register(device, register, value)
    }

    /// Close and re-open the link.
    pub fn reconnect(&self) -> Result<(), TransportError> {
        self.inner.lock().transport.reconnect()
    }

    /// Short description of the link for log messages.
    pub fn describe(&self) -> String {
        self.inner.lock().transport.describe()
    }

    /// Number of workers currently holding a lease.
    pub fn active_leases(&self) -> usize {
        self.inner.lock().leases
    }

    /// Open the link if needed and register a worker that uses it.
    ///
    /// Opening and counting happen under one lock, so a lease released concurrently
    /// cannot close the link under the new holder. The link is closed when the last
    /// outstanding lease is released.
    pub fn lease(&self) -> Result<TransportLease, TransportError> {
        let mut link = self.inner.lock();
        if !link.transport.is_open() {
            link.transport.open()?;
        }
        link.leases += 1;
        Ok(TransportLease {
            transport: self.clone(),
            released: false,
        })
    }
}

/// A worker's claim on a [`SharedTransport`].
pub struct TransportLease {
    transport: SharedTransport,
    released: bool,
}

impl TransportLease {
    /// The leased transport.
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Give the lease back, closing the link if this was the last one.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut link = self.transport.inner.lock();
        link.leases = link.leases.saturating_sub(1);
        if link.leases > 0 {
            debug!(remaining = link.leases, "Transport still leased, leaving link open");
            return;
        }
        match link.transport.close() {
            Ok(()) => debug!(link = %link.transport.describe(), "Link closed"),
            Err(err) => warn!(error = %err, "Failed to close link"),
        }
    }
}

impl Drop for TransportLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
