//! CAN Bus Publish/Subscribe Middleware for Rust
//!
//! This crate turns the fixed hardware resources of a dual CAN controller
//! (3 transmit mailboxes and 14 filter banks per instance) into any number of
//! logical producers and consumers, and moves frames safely between interrupt
//! and task context.
//!
//! # Features
//!
//! - RX subscriptions with exact, masked and wildcard matching
//! - Automatic hardware filter bank allocation per instance
//! - Periodic and on-demand TX slots with closure-packed payloads
//! - Direct or queued delivery on both the RX and TX paths
//! - Deadline-bounded mailbox waits
//! - Saturating per-instance diagnostics counters
//!
//! # Example
//!
//! ```
//! use canbus_router::sim::SimPeripheral;
//! use canbus_router::{CanBus, Config, Fifo, IdWidth, Instance, RxParams, TxParams, TxPayload};
//!
//! fn main() -> canbus_router::Result<()> {
//!     let bus = CanBus::with_system_clock(Config::default(), SimPeripheral::new());
//!     bus.start()?;
//!
//!     // Subscribe to every identifier in 0x100..=0x1FF
//!     bus.register_rx(
//!         RxParams::new(Instance::Can1, 0x100, IdWidth::Standard, |frame, meta| {
//!             println!("RX  {} @ {} ms", frame, meta.timestamp_ms);
//!         })
//!         .masked(0x700),
//!     )?;
//!
//!     // Heartbeat every 100 ms
//!     let heartbeat = TxParams::new(Instance::Can1, 0x700, IdWidth::Standard)
//!         .period(100)
//!         .payload(TxPayload::bytes(&[0x05])?);
//!     bus.register_tx(heartbeat)?;
//!
//!     // One-off frame
//!     bus.send(Instance::Can1, 0x123, IdWidth::Standard, &[0x01, 0x02, 0x03, 0x04])?;
//!
//!     // Interrupt handler and processing task
//!     bus.on_rx_pending(Instance::Can1, Fifo::Fifo0);
//!     bus.process_rx();
//!     Ok(())
//! }
//! ```
//!
//! # Platform Integration
//!
//! Implement [`CanPeripheral`] for the controller and [`Clock`] for the tick
//! source, then call [`CanBus::on_rx_pending`], [`CanBus::on_tx_complete`] and
//! [`CanBus::on_bus_error`] from the matching interrupt handlers.

pub mod bus;
pub mod config;
pub mod constants;
pub mod diagnostics;
pub mod error;
pub mod filter;
pub mod frame;
pub mod peripheral;
mod queue;
pub mod rx;
pub mod sim;
pub mod tx;

// Re-export main types at crate root
pub use constants::{
    // Capacities
    MAX_RX_HANDLES,
    MAX_TX_HANDLES,
    RX_QUEUE_CAPACITY,
    TX_QUEUE_CAPACITY,
    // Hardware resources
    FILTER_BANKS_PER_INSTANCE,
    TX_MAILBOX_COUNT,
    // Identifier limits
    CAN_EFF_MAX,
    CAN_MAX_DLEN,
    CAN_SFF_MAX,
};

pub use bus::CanBus;
pub use config::{Config, FilterOverflowPolicy, RxDispatch, TxMode};
pub use diagnostics::DiagnosticsSnapshot;
pub use error::{CanError, HardwareError, Result};
pub use filter::{plan_filters, FilterBank, FilterPlan, FilterRequest, MatchMode};
pub use frame::{Fifo, Frame, IdWidth, Instance};
pub use peripheral::{CanPeripheral, Clock, Mailbox, ManualClock, SystemClock};
pub use rx::{RxCallback, RxHandle, RxMeta, RxParams};
pub use tx::{PackFn, PeriodicReport, TxHandle, TxParams, TxPayload};
