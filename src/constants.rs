//! Middleware capacities and defaults
//!
//! This module contains the compile-time sizing of the registries, queues and
//! filter-bank ranges, together with the default timing values used by
//! [`Config`](crate::config::Config).

// ============================================================================
// Registry Capacities
// ============================================================================

/// Maximum number of simultaneously registered RX subscriptions
pub const MAX_RX_HANDLES: usize = 32;
/// Maximum number of simultaneously registered TX slots
pub const MAX_TX_HANDLES: usize = 16;

// ============================================================================
// ISR/Task Handoff Queues
// ============================================================================

/// Depth of the RX queue between interrupt context and the processing task
///
/// Must be a power of two.
pub const RX_QUEUE_CAPACITY: usize = 32;
/// Depth of the TX queue between the application and the transmit task
///
/// Must be a power of two.
pub const TX_QUEUE_CAPACITY: usize = 16;

// ============================================================================
// Hardware Resources
// ============================================================================

/// Number of bus instances (physical CAN controllers)
pub const INSTANCE_COUNT: usize = 2;
/// Number of transmit mailboxes per instance
pub const TX_MAILBOX_COUNT: u8 = 3;
/// Number of receive FIFOs per instance
pub const RX_FIFO_COUNT: usize = 2;
/// Total number of filter banks shared by both instances
pub const TOTAL_FILTER_BANKS: u8 = 28;
/// First filter bank owned by the second instance
pub const CAN2_FILTER_BANK_START: u8 = 14;
/// Filter banks available to a single instance
pub const FILTER_BANKS_PER_INSTANCE: usize = 14;

// ============================================================================
// CAN Identifier and Payload Limits
// ============================================================================

/// Largest standard (11-bit) identifier
pub const CAN_SFF_MAX: u32 = 0x0000_07FF;
/// Largest extended (29-bit) identifier
pub const CAN_EFF_MAX: u32 = 0x1FFF_FFFF;
/// Maximum data length of a classic CAN frame
pub const CAN_MAX_DLEN: usize = 8;

// ============================================================================
// Default Timing (milliseconds)
// ============================================================================

/// Default time a blocking send waits for a free mailbox
pub const DEFAULT_TX_TIMEOUT_MS: u64 = 100;
/// Default time a queued send waits for room in the TX queue
pub const DEFAULT_TX_QUEUE_TIMEOUT_MS: u64 = 10;
/// Default sleep between two mailbox availability checks
pub const DEFAULT_MAILBOX_POLL_MS: u64 = 1;
