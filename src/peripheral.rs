//! Hardware and time boundaries
//!
//! The middleware drives a CAN controller through [`CanPeripheral`] and reads
//! time through [`Clock`]. Both are implemented by the platform; the crate
//! ships [`SimPeripheral`](crate::sim::SimPeripheral), [`SystemClock`] and
//! [`ManualClock`] for host use.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use crate::error::HardwareError;
use crate::filter::FilterBank;
use crate::frame::{Fifo, Frame, Instance};

/// Index of a hardware transmit mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mailbox(pub u8);

/// CAN controller as seen by the middleware
///
/// Methods take `&self` because they are called from both interrupt and task
/// context; implementations map them onto peripheral registers.
pub trait CanPeripheral: Send + Sync {
    /// Leave initialization mode and join the bus
    fn start(&self, instance: Instance) -> Result<(), HardwareError>;

    /// Leave the bus
    fn stop(&self, instance: Instance);

    /// Program one filter bank (global bank index)
    fn configure_filter(&self, bank: u8, filter: &FilterBank) -> Result<(), HardwareError>;

    /// Number of empty transmit mailboxes
    fn free_mailboxes(&self, instance: Instance) -> u8;

    /// Place a frame into an empty mailbox
    fn add_tx_frame(&self, frame: &Frame) -> Result<Mailbox, HardwareError>;

    /// Pop the oldest frame pending in a receive FIFO
    fn receive(&self, instance: Instance, fifo: Fifo) -> Option<Frame>;
}

/// Millisecond tick source
///
/// Drives the periodic TX scheduler and the timestamps of received frames.
/// Mailbox and TX queue waits are measured with [`std::time::Instant`]
/// instead, so they elapse in real time even under a [`ManualClock`].
pub trait Clock: Send + Sync {
    /// Current tick; wraps after `u32::MAX`
    fn now_ms(&self) -> u32;
}

/// Wall clock measured from its creation
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Start a clock at tick zero
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        // Truncation gives the usual wrapping tick
        self.origin.elapsed().as_millis() as u32
    }
}

/// Clock advanced explicitly, for tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    /// Create a clock at `start_ms`
    pub fn new(start_ms: u32) -> Self {
        Self {
            now: AtomicU32::new(start_ms),
        }
    }

    /// Jump to an absolute tick
    pub fn set(&self, ms: u32) {
        self.now.store(ms, Ordering::Relaxed);
    }

    /// Move forward by `ms`, wrapping like a hardware tick
    pub fn advance(&self, ms: u32) {
        let now = self.now.load(Ordering::Relaxed);
        self.now.store(now.wrapping_add(ms), Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::Relaxed)
    }
}
