//! Per-instance diagnostics counters
//!
//! Counters are plain atomics incremented from any context. They saturate at
//! `u32::MAX` instead of wrapping back to zero.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::constants::INSTANCE_COUNT;
use crate::frame::Instance;

/// Event counted by [`Diagnostics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    RxQueueOverflow,
    TxQueueOverflow,
    TxTimeout,
    HardwareError,
    TxComplete,
}

#[derive(Debug, Default)]
struct Counter(AtomicU32);

impl Counter {
    fn increment(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_add(1));
    }

    fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct InstanceCounters {
    rx_queue_overflow: Counter,
    tx_queue_overflow: Counter,
    tx_timeout: Counter,
    hardware_error: Counter,
    tx_complete: Counter,
}

impl InstanceCounters {
    fn counter(&self, event: Event) -> &Counter {
        match event {
            Event::RxQueueOverflow => &self.rx_queue_overflow,
            Event::TxQueueOverflow => &self.tx_queue_overflow,
            Event::TxTimeout => &self.tx_timeout,
            Event::HardwareError => &self.hardware_error,
            Event::TxComplete => &self.tx_complete,
        }
    }

    fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            rx_queue_overflow: self.rx_queue_overflow.get(),
            tx_queue_overflow: self.tx_queue_overflow.get(),
            tx_timeout: self.tx_timeout.get(),
            hardware_error: self.hardware_error.get(),
            tx_complete: self.tx_complete.get(),
        }
    }

    fn clear(&self) {
        self.rx_queue_overflow.clear();
        self.tx_queue_overflow.clear();
        self.tx_timeout.clear();
        self.hardware_error.clear();
        self.tx_complete.clear();
    }
}

/// Counter values at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiagnosticsSnapshot {
    /// Frames dropped because the RX queue was full
    pub rx_queue_overflow: u32,
    /// Sends refused because the TX queue was full
    pub tx_queue_overflow: u32,
    /// Sends that found no free mailbox before their deadline
    pub tx_timeout: u32,
    /// Peripheral rejections and bus-error notifications
    pub hardware_error: u32,
    /// Mailbox completion notifications
    pub tx_complete: u32,
}

impl DiagnosticsSnapshot {
    /// Sum of all error counters, excluding completions
    pub fn errors(&self) -> u32 {
        self.rx_queue_overflow
            .saturating_add(self.tx_queue_overflow)
            .saturating_add(self.tx_timeout)
            .saturating_add(self.hardware_error)
    }

    fn saturating_add(self, other: Self) -> Self {
        Self {
            rx_queue_overflow: self.rx_queue_overflow.saturating_add(other.rx_queue_overflow),
            tx_queue_overflow: self.tx_queue_overflow.saturating_add(other.tx_queue_overflow),
            tx_timeout: self.tx_timeout.saturating_add(other.tx_timeout),
            hardware_error: self.hardware_error.saturating_add(other.hardware_error),
            tx_complete: self.tx_complete.saturating_add(other.tx_complete),
        }
    }
}

impl std::fmt::Display for DiagnosticsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rx_overflow={} tx_overflow={} tx_timeout={} hw_error={} tx_complete={}",
            self.rx_queue_overflow,
            self.tx_queue_overflow,
            self.tx_timeout,
            self.hardware_error,
            self.tx_complete
        )
    }
}

/// Counters for every instance
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    instances: [InstanceCounters; INSTANCE_COUNT],
}

impl Diagnostics {
    pub fn record(&self, instance: Instance, event: Event) {
        self.instances[instance.index()].counter(event).increment();
    }

    pub fn snapshot(&self, instance: Instance) -> DiagnosticsSnapshot {
        self.instances[instance.index()].snapshot()
    }

    pub fn total(&self) -> DiagnosticsSnapshot {
        self.instances
            .iter()
            .map(InstanceCounters::snapshot)
            .fold(DiagnosticsSnapshot::default(), DiagnosticsSnapshot::saturating_add)
    }

    /// Clear every counter of every instance as one step
    pub fn reset(&self) {
        critical_section::with(|_| {
            for counters in &self.instances {
                counters.clear();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_per_instance() {
        let diag = Diagnostics::default();
        diag.record(Instance::Can1, Event::TxTimeout);
        diag.record(Instance::Can1, Event::TxTimeout);
        diag.record(Instance::Can2, Event::RxQueueOverflow);

        assert_eq!(diag.snapshot(Instance::Can1).tx_timeout, 2);
        assert_eq!(diag.snapshot(Instance::Can1).rx_queue_overflow, 0);
        assert_eq!(diag.snapshot(Instance::Can2).rx_queue_overflow, 1);

        let total = diag.total();
        assert_eq!(total.tx_timeout, 2);
        assert_eq!(total.rx_queue_overflow, 1);
        assert_eq!(total.errors(), 3);
    }

    #[test]
    fn test_saturation() {
        let diag = Diagnostics::default();
        diag.instances[0].hardware_error.0.store(u32::MAX - 1, Ordering::Relaxed);
        diag.record(Instance::Can1, Event::HardwareError);
        diag.record(Instance::Can1, Event::HardwareError);
        assert_eq!(diag.snapshot(Instance::Can1).hardware_error, u32::MAX);

        diag.instances[1].hardware_error.0.store(5, Ordering::Relaxed);
        assert_eq!(diag.total().hardware_error, u32::MAX);
    }

    #[test]
    fn test_reset() {
        let diag = Diagnostics::default();
        diag.record(Instance::Can1, Event::TxComplete);
        diag.record(Instance::Can2, Event::TxQueueOverflow);
        diag.reset();
        assert_eq!(diag.total(), DiagnosticsSnapshot::default());
    }

    #[test]
    fn test_snapshot_display() {
        let snap = DiagnosticsSnapshot {
            tx_timeout: 1,
            ..Default::default()
        };
        assert_eq!(
            snap.to_string(),
            "rx_overflow=0 tx_overflow=0 tx_timeout=1 hw_error=0 tx_complete=0"
        );
    }
}
