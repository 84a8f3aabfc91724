//! CAN frame and addressing types
//!
//! This module provides the [`Frame`] value exchanged between the hardware,
//! the handoff queues and the application, together with the small enums that
//! address it: bus [`Instance`], identifier [`IdWidth`] and receive [`Fifo`].

use core::ops::Range;

use embedded_can::{ExtendedId, Id, StandardId};

use crate::constants::{
    CAN2_FILTER_BANK_START, CAN_EFF_MAX, CAN_MAX_DLEN, CAN_SFF_MAX, TOTAL_FILTER_BANKS,
};
use crate::error::{CanError, Result};

/// Physical CAN controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Instance {
    /// First controller (filter bank master)
    Can1 = 0,
    /// Second controller
    Can2 = 1,
}

impl Instance {
    /// All instances in index order
    pub const ALL: [Instance; 2] = [Instance::Can1, Instance::Can2];

    /// Index into per-instance tables
    pub fn index(self) -> usize {
        self as usize
    }

    /// Range of hardware filter banks owned by this instance
    pub fn filter_banks(self) -> Range<u8> {
        match self {
            Instance::Can1 => 0..CAN2_FILTER_BANK_START,
            Instance::Can2 => CAN2_FILTER_BANK_START..TOTAL_FILTER_BANKS,
        }
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instance::Can1 => write!(f, "CAN1"),
            Instance::Can2 => write!(f, "CAN2"),
        }
    }
}

/// Identifier width class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdWidth {
    /// 11-bit identifier
    Standard,
    /// 29-bit identifier
    Extended,
}

impl IdWidth {
    /// Largest identifier value of this width
    pub fn max_id(self) -> u32 {
        match self {
            IdWidth::Standard => CAN_SFF_MAX,
            IdWidth::Extended => CAN_EFF_MAX,
        }
    }

    /// Build a validated identifier of this width
    pub fn id(self, raw: u32) -> Result<Id> {
        let id = match self {
            IdWidth::Standard => u16::try_from(raw)
                .ok()
                .and_then(StandardId::new)
                .map(Id::Standard),
            IdWidth::Extended => ExtendedId::new(raw).map(Id::Extended),
        };
        id.ok_or(CanError::InvalidId { raw, width: self })
    }

    /// Check that `raw` fits this width
    pub fn validate(self, raw: u32) -> Result<()> {
        self.id(raw).map(|_| ())
    }

    /// Width of an `embedded_can` identifier
    pub fn of(id: Id) -> Self {
        match id {
            Id::Standard(_) => IdWidth::Standard,
            Id::Extended(_) => IdWidth::Extended,
        }
    }
}

/// Receive FIFO a filter bank routes accepted frames into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Fifo {
    /// FIFO 0
    #[default]
    Fifo0 = 0,
    /// FIFO 1
    Fifo1 = 1,
}

impl Fifo {
    /// Index into per-FIFO tables
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Raw value of an `embedded_can` identifier
pub fn raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(id) => id.as_raw() as u32,
        Id::Extended(id) => id.as_raw(),
    }
}

/// Classic CAN data frame
///
/// A frame is an immutable value. It is copied, never shared, when it crosses
/// between interrupt and task context.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    instance: Instance,
    id: Id,
    len: u8,
    data: [u8; CAN_MAX_DLEN],
}

impl Frame {
    /// Create a frame from a raw identifier and its width
    ///
    /// # Arguments
    /// * `instance` - Bus the frame belongs to
    /// * `raw_id` - Identifier value
    /// * `width` - Standard or extended identifier
    /// * `data` - Payload (0-8 bytes)
    pub fn new(instance: Instance, raw_id: u32, width: IdWidth, data: &[u8]) -> Result<Self> {
        let id = width.id(raw_id)?;
        Self::with_id(instance, id, data)
    }

    /// Create a frame from an already validated identifier
    pub fn with_id(instance: Instance, id: impl Into<Id>, data: &[u8]) -> Result<Self> {
        if data.len() > CAN_MAX_DLEN {
            return Err(CanError::InvalidLength(data.len()));
        }
        let mut buf = [0u8; CAN_MAX_DLEN];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            instance,
            id: id.into(),
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Bus instance
    pub fn instance(&self) -> Instance {
        self.instance
    }

    /// Identifier
    pub fn id(&self) -> Id {
        self.id
    }

    /// Identifier value without width information
    pub fn raw_id(&self) -> u32 {
        raw_id(self.id)
    }

    /// Identifier width
    pub fn width(&self) -> IdWidth {
        IdWidth::of(self.id)
    }

    /// Check if this is an extended ID frame (29-bit)
    pub fn is_extended(&self) -> bool {
        self.width() == IdWidth::Extended
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Check if the frame carries no payload
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len()]
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data_str = self
            .data()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        let ext = if self.is_extended() { " EXT" } else { "" };

        write!(
            f,
            "{}  {:>8X}{}   [{}]  {}",
            self.instance,
            self.raw_id(),
            ext,
            self.len,
            data_str
        )
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("instance", &self.instance)
            .field("id", &format_args!("0x{:08X}", self.raw_id()))
            .field("width", &self.width())
            .field("data", &self.data())
            .finish()
    }
}
