//! Error types for the CAN middleware
//!
//! Every registry and TX/RX path operation reports failures through
//! [`CanError`]. Full tables, duplicate identifiers, timeouts and overflows are
//! routine conditions for the caller to handle; none of them panic.

use thiserror::Error;

use crate::frame::{IdWidth, Instance};

/// Result type alias for middleware operations
pub type Result<T> = std::result::Result<T, CanError>;

/// Failure reported by a [`CanPeripheral`](crate::peripheral::CanPeripheral)
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareError {
    /// The peripheral refused the request (e.g. mailbox write rejected)
    #[error("peripheral rejected the request")]
    Rejected,

    /// The peripheral is not in a state that accepts the request
    #[error("peripheral not ready")]
    NotReady,

    /// Bus error reported by the controller
    #[error("bus error (code 0x{0:08X})")]
    Bus(u32),
}

/// Error types for middleware operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanError {
    /// Identifier does not fit its width class
    #[error("Invalid {width:?} identifier 0x{raw:X}")]
    InvalidId { raw: u32, width: IdWidth },

    /// Payload longer than a classic CAN frame
    #[error("Invalid payload length {0} (max 8)")]
    InvalidLength(usize),

    /// The instance is not enabled in the configuration
    #[error("Instance {0} is not enabled")]
    InstanceDisabled(Instance),

    /// No free slot left in the registry
    #[error("Registry full")]
    RegistryFull,

    /// An RX subscription already exists for the identifier
    #[error("Identifier already registered")]
    AlreadyRegistered,

    /// Unknown or stale handle
    #[error("Handle not found")]
    NotFound,

    /// The instance has no filter bank left for another identifier
    #[error("Filter banks exhausted on {instance}: {needed} needed, {available} available")]
    FilterBanksExhausted {
        instance: Instance,
        needed: usize,
        available: usize,
    },

    /// No mailbox became free before the deadline
    #[error("Timeout waiting for a transmit mailbox")]
    Timeout,

    /// Handoff queue had no room for the frame
    #[error("Queue full")]
    QueueFull,

    /// No mailbox free and no queue to defer to (interrupt context send)
    #[error("No transmit mailbox available")]
    MailboxBusy,

    /// Peripheral error
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    /// The bus has not been started
    #[error("Bus not initialized")]
    NotInitialized,

    /// The bus is already started
    #[error("Bus already started")]
    AlreadyStarted,
}

impl CanError {
    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, CanError::Timeout)
    }

    /// Check if this error originates from the peripheral
    pub fn is_hardware_error(&self) -> bool {
        matches!(self, CanError::Hardware(_))
    }

    /// Check if this error is a rejected registration
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            CanError::RegistryFull
                | CanError::AlreadyRegistered
                | CanError::FilterBanksExhausted { .. }
        )
    }
}
