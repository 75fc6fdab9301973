//! Mock register transport.
//!
//! Simulates a bank of controllers without hardware. Clones share state, so a test can
//! keep one handle for scripting failures and inspecting counters while the acquisition
//! loop owns another.
//!
//! ```rust
//! use autoclave_daq::transport::{MockTransport, RegisterTransport};
//!
//! let mock = MockTransport::new().with_register(1, 0x1000, 1234);
//! let mut handle = mock.clone();
//! handle.open().unwrap();
//! assert_eq!(handle.read_register(1, 0x1000).unwrap(), 1234);
//! assert_eq!(mock.counters().reads, 1);
//! ```

use crate::transport::{FrameError, RegisterTransport, TransportError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Call counters recorded by [`MockTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCounters {
    /// Successful opens
    pub opens: usize,
    /// Closes of an open link
    pub closes: usize,
    /// Reconnect attempts (successful or not)
    pub reconnects: usize,
    /// Read attempts
    pub reads: usize,
    /// Write attempts
    pub writes: usize,
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    fail_open: bool,
    registers: HashMap<(u8, u16), u16>,
    failing_reads: HashSet<(u8, u16)>,
    failing_writes: HashSet<(u8, u16)>,
    counters: MockCounters,
}

/// In-memory register bank implementing [`RegisterTransport`].
///
/// Unknown registers read as 0.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a closed mock with an empty register bank.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload a register value.
    pub fn with_register(self, device: u8, register: u16, value: u16) -> Self {
        self.set_register(device, register, value);
        self
    }

    /// Set a register value.
    pub fn set_register(&self, device: u8, register: u16, value: u16) {
        self.state.lock().registers.insert((device, register), value);
    }

    /// Current value of a register, as last written or preloaded.
    pub fn register(&self, device: u8, register: u16) -> Option<u16> {
        self.state.lock().registers.get(&(device, register)).copied()
    }

    /// Make every read of this register fail with a timeout.
    pub fn fail_reads(&self, device: u8, register: u16) {
        self.state.lock().failing_reads.insert((device, register));
    }

    /// Make reads of this register succeed again.
    pub fn restore_reads(&self, device: u8, register: u16) {
        self.state.lock().failing_reads.remove(&(device, register));
    }

    /// Make every write of this register fail with a device exception.
    pub fn fail_writes(&self, device: u8, register: u16) {
        self.state.lock().failing_writes.insert((device, register));
    }

    /// Make opens fail (also affects reconnects).
    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Snapshot of the call counters.
    pub fn counters(&self) -> MockCounters {
        self.state.lock().counters
    }
}

impl RegisterTransport for MockTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.open {
            return Ok(());
        }
        if state.fail_open {
            return Err(TransportError::Link {
                port: "mock".into(),
                reason: "simulated open failure".into(),
            });
        }
        state.open = true;
        state.counters.opens += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            state.counters.closes += 1;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn read_register(&mut self, device: u8, register: u16) -> Result<u16, TransportError> {
        let mut state = self.state.lock();
        state.counters.reads += 1;
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        if state.failing_reads.contains(&(device, register)) {
            return Err(TransportError::Read {
                device,
                register,
                source: FrameError::Timeout,
            });
        }
        Ok(state.registers.get(&(device, register)).copied().unwrap_or(0))
    }

    fn write_register(
        &mut self,
        device: u8,
        register: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.counters.writes += 1;
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        if state.failing_writes.contains(&(device, register)) {
            return Err(TransportError::Write {
                device,
                register,
                source: FrameError::Exception {
                    function: 0x06,
                    code: 0x02,
                },
            });
        }
        state.registers.insert((device, register), value);
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.state.lock().counters.reconnects += 1;
        self.close()?;
        self.open()
            .map_err(|err| TransportError::Reconnect(Box::new(err)))
    }
}
