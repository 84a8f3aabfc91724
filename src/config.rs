//! Deployment configuration
//!
//! [`Config`] selects how frames cross the interrupt/task boundary and how
//! long the TX path may wait. Values are fixed once the bus is constructed.

use std::time::Duration;

use crate::constants::{
    DEFAULT_MAILBOX_POLL_MS, DEFAULT_TX_QUEUE_TIMEOUT_MS, DEFAULT_TX_TIMEOUT_MS, INSTANCE_COUNT,
};
use crate::frame::Instance;

/// How received frames reach their callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxDispatch {
    /// Callbacks run inside the frame-pending interrupt
    ///
    /// Callbacks must be short and must never block.
    Direct,
    /// Frames are queued and dispatched by [`process_rx`](crate::bus::CanBus::process_rx)
    #[default]
    Queued,
}

/// How application sends reach the mailboxes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxMode {
    /// `send` waits for a mailbox in the caller's context
    #[default]
    Direct,
    /// `send` enqueues; [`process_tx`](crate::bus::CanBus::process_tx) drains the queue
    Queued,
}

/// What to do when an instance has more identifiers than filter banks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterOverflowPolicy {
    /// Refuse the registration that would overflow the quota
    #[default]
    Reject,
    /// Open the hardware filter completely and match in software only
    AcceptAll,
}

/// Middleware configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Enabled instances, indexed by [`Instance::index`]
    pub instances: [bool; INSTANCE_COUNT],
    /// RX delivery discipline
    pub rx_dispatch: RxDispatch,
    /// TX delivery discipline
    pub tx_mode: TxMode,
    /// Mailbox wait used by `send` and the TX task
    pub tx_timeout: Duration,
    /// Queue wait used by `send` in queued TX mode
    pub tx_queue_timeout: Duration,
    /// Sleep between two mailbox availability checks
    pub mailbox_poll_interval: Duration,
    /// Filter-bank quota overflow handling
    pub filter_overflow: FilterOverflowPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instances: [true, false],
            rx_dispatch: RxDispatch::default(),
            tx_mode: TxMode::default(),
            tx_timeout: Duration::from_millis(DEFAULT_TX_TIMEOUT_MS),
            tx_queue_timeout: Duration::from_millis(DEFAULT_TX_QUEUE_TIMEOUT_MS),
            mailbox_poll_interval: Duration::from_millis(DEFAULT_MAILBOX_POLL_MS),
            filter_overflow: FilterOverflowPolicy::default(),
        }
    }
}

impl Config {
    /// Enable or disable an instance
    pub fn with_instance(mut self, instance: Instance, enabled: bool) -> Self {
        self.instances[instance.index()] = enabled;
        self
    }

    /// Select the RX delivery discipline
    pub fn with_rx_dispatch(mut self, rx_dispatch: RxDispatch) -> Self {
        self.rx_dispatch = rx_dispatch;
        self
    }

    /// Select the TX delivery discipline
    pub fn with_tx_mode(mut self, tx_mode: TxMode) -> Self {
        self.tx_mode = tx_mode;
        self
    }

    /// Set the default mailbox wait
    pub fn with_tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = timeout;
        self
    }

    /// Set the TX queue wait
    pub fn with_tx_queue_timeout(mut self, timeout: Duration) -> Self {
        self.tx_queue_timeout = timeout;
        self
    }

    /// Set the mailbox polling interval
    pub fn with_mailbox_poll_interval(mut self, interval: Duration) -> Self {
        self.mailbox_poll_interval = interval;
        self
    }

    /// Select the filter overflow policy
    pub fn with_filter_overflow(mut self, policy: FilterOverflowPolicy) -> Self {
        self.filter_overflow = policy;
        self
    }

    /// Check if an instance is enabled
    pub fn is_enabled(&self, instance: Instance) -> bool {
        self.instances[instance.index()]
    }
}
