//! TX slot registry
//!
//! A TX slot binds an identifier to a payload source and an optional period.
//! The periodic scheduler fires a slot once `now - last_fire >= period`, with
//! wrapping tick arithmetic.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_can::Id;
use heapless::Vec;
use log::debug;

use crate::constants::{CAN_MAX_DLEN, MAX_TX_HANDLES};
use crate::error::{CanError, Result};
use crate::frame::{Frame, IdWidth, Instance};

/// Closure packing a slot's backing data into a frame buffer
///
/// Returns the payload length; values above 8 are clamped.
pub type PackFn = Box<dyn FnMut(&mut [u8; CAN_MAX_DLEN]) -> usize + Send>;

/// Where a slot's payload comes from
pub enum TxPayload {
    /// Zero-length frame
    Empty,
    /// Stored bytes copied on every send
    Bytes(Vec<u8, CAN_MAX_DLEN>),
    /// Closure called on every send
    Packed(PackFn),
}

impl TxPayload {
    /// Stored payload; fails above 8 bytes
    pub fn bytes(data: &[u8]) -> Result<Self> {
        Vec::from_slice(data)
            .map(TxPayload::Bytes)
            .map_err(|_| CanError::InvalidLength(data.len()))
    }

    /// Payload produced by `pack` at send time
    ///
    /// # Example
    /// ```
    /// use std::sync::atomic::{AtomicU16, Ordering};
    /// use std::sync::Arc;
    /// use canbus_router::TxPayload;
    ///
    /// let rpm = Arc::new(AtomicU16::new(0));
    /// let source = rpm.clone();
    /// let payload = TxPayload::packed(move |buf| {
    ///     buf[..2].copy_from_slice(&source.load(Ordering::Relaxed).to_le_bytes());
    ///     2
    /// });
    /// ```
    pub fn packed<F>(pack: F) -> Self
    where
        F: FnMut(&mut [u8; CAN_MAX_DLEN]) -> usize + Send + 'static,
    {
        TxPayload::Packed(Box::new(pack))
    }

    fn pack(&mut self, buf: &mut [u8; CAN_MAX_DLEN]) -> usize {
        match self {
            TxPayload::Empty => 0,
            TxPayload::Bytes(data) => {
                buf[..data.len()].copy_from_slice(data);
                data.len()
            }
            TxPayload::Packed(pack) => pack(buf).min(CAN_MAX_DLEN),
        }
    }
}

impl std::fmt::Debug for TxPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxPayload::Empty => write!(f, "Empty"),
            TxPayload::Bytes(data) => f.debug_tuple("Bytes").field(&data.as_slice()).finish(),
            TxPayload::Packed(_) => write!(f, "Packed(..)"),
        }
    }
}

/// TX registration parameters
#[derive(Debug)]
pub struct TxParams {
    /// Instance to transmit on
    pub instance: Instance,
    /// Identifier of every frame sent from the slot
    pub can_id: u32,
    /// Standard or extended identifier
    pub width: IdWidth,
    /// Period in milliseconds; 0 means manual sends only
    pub period_ms: u32,
    /// Payload source
    pub payload: TxPayload,
}

impl TxParams {
    /// Manual slot with an empty payload
    pub fn new(instance: Instance, can_id: u32, width: IdWidth) -> Self {
        Self {
            instance,
            can_id,
            width,
            period_ms: 0,
            payload: TxPayload::Empty,
        }
    }

    /// Fire every `period_ms` milliseconds
    pub fn period(mut self, period_ms: u32) -> Self {
        self.period_ms = period_ms;
        self
    }

    /// Use `payload` as the slot's source
    pub fn payload(mut self, payload: TxPayload) -> Self {
        self.payload = payload;
        self
    }
}

/// Handle to a TX slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHandle {
    index: u16,
    generation: u32,
}

impl TxHandle {
    /// Slot index inside the registry
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Outcome of one periodic tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeriodicReport {
    /// Slots that were due and sent
    pub fired: usize,
    /// Slots that were due but whose send failed
    pub failed: usize,
}

impl PeriodicReport {
    /// Slots that were due this tick
    pub fn due(&self) -> usize {
        self.fired + self.failed
    }
}

struct Entry {
    instance: Instance,
    id: Id,
    period_ms: u32,
    last_fire: u32,
    payload: TxPayload,
}

impl Entry {
    fn pack(&mut self) -> Result<Frame> {
        let mut buf = [0u8; CAN_MAX_DLEN];
        let len = self.payload.pack(&mut buf);
        Frame::with_id(self.instance, self.id, &buf[..len])
    }
}

/// Generation at which a slot is retired instead of being reused
const RETIRED: u32 = u32::MAX;

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

impl Slot {
    fn is_free(&self) -> bool {
        self.entry.is_none() && self.generation != RETIRED
    }
}

struct Inner {
    slots: [Slot; MAX_TX_HANDLES],
    count: usize,
}

impl Inner {
    fn entry_mut(&mut self, handle: TxHandle) -> Result<&mut Entry> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(CanError::NotFound)?;
        if slot.generation != handle.generation {
            return Err(CanError::NotFound);
        }
        slot.entry.as_mut().ok_or(CanError::NotFound)
    }
}

/// TX slot table
pub(crate) struct TxRegistry<M: RawMutex>(Mutex<M, RefCell<Inner>>);

impl<M: RawMutex> Default for TxRegistry<M> {
    fn default() -> Self {
        Self(Mutex::new(RefCell::new(Inner {
            slots: core::array::from_fn(|_| Slot::default()),
            count: 0,
        })))
    }
}

impl<M: RawMutex> TxRegistry<M> {
    /// Add a slot whose period starts counting at `now_ms`
    ///
    /// Several slots may share an identifier, each with its own period and
    /// payload source.
    pub fn register(&self, params: TxParams, now_ms: u32) -> Result<TxHandle> {
        let id = params.width.id(params.can_id)?;

        self.0.lock(|cell| {
            let mut inner = cell.borrow_mut();

            let index = inner
                .slots
                .iter()
                .position(Slot::is_free)
                .ok_or(CanError::RegistryFull)?;

            let slot = &mut inner.slots[index];
            slot.entry = Some(Entry {
                instance: params.instance,
                id,
                period_ms: params.period_ms,
                last_fire: now_ms,
                payload: params.payload,
            });
            let generation = slot.generation;
            inner.count += 1;

            debug!(
                "TX register {} id=0x{:X} period={}ms -> slot {}",
                params.instance, params.can_id, params.period_ms, index
            );
            Ok(TxHandle {
                index: index as u16,
                generation,
            })
        })
    }

    /// Release a slot
    pub fn unregister(&self, handle: TxHandle) -> Result<()> {
        self.0.lock(|cell| {
            let mut inner = cell.borrow_mut();
            inner.entry_mut(handle)?;

            let slot = &mut inner.slots[handle.index()];
            slot.entry = None;
            slot.generation = slot.generation.saturating_add(1);
            inner.count -= 1;
            debug!("TX unregister slot {}", handle.index());
            Ok(())
        })
    }

    /// Change a slot's period; 0 stops periodic sends
    pub fn set_period(&self, handle: TxHandle, period_ms: u32) -> Result<()> {
        self.0.lock(|cell| {
            cell.borrow_mut().entry_mut(handle)?.period_ms = period_ms;
            Ok(())
        })
    }

    /// Replace a slot's source with stored bytes
    pub fn update_data(&self, handle: TxHandle, data: &[u8]) -> Result<()> {
        let payload = TxPayload::bytes(data)?;
        self.0.lock(|cell| {
            cell.borrow_mut().entry_mut(handle)?.payload = payload;
            Ok(())
        })
    }

    /// Pack a slot's frame and restart its period at `now_ms`
    pub fn fire(&self, handle: TxHandle, now_ms: u32) -> Result<Frame> {
        self.0.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let entry = inner.entry_mut(handle)?;
            entry.last_fire = now_ms;
            entry.pack()
        })
    }

    /// Frame with the slot's identifier and caller-supplied data
    pub fn frame_with(&self, handle: TxHandle, data: &[u8]) -> Result<Frame> {
        self.0.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let entry = inner.entry_mut(handle)?;
            Frame::with_id(entry.instance, entry.id, data)
        })
    }

    /// Pack every slot due at `now_ms`, in slot order
    ///
    /// Each due slot's period restarts at `now_ms` whether or not its send
    /// later succeeds.
    pub fn fire_due(&self, now_ms: u32) -> Vec<Result<Frame>, MAX_TX_HANDLES> {
        self.0.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let mut due = Vec::new();
            for entry in inner.slots.iter_mut().filter_map(|slot| slot.entry.as_mut()) {
                if entry.period_ms == 0 || now_ms.wrapping_sub(entry.last_fire) < entry.period_ms {
                    continue;
                }
                entry.last_fire = now_ms;
                // At most MAX_TX_HANDLES entries exist
                let _ = due.push(entry.pack());
            }
            due
        })
    }

    /// Number of active slots
    pub fn registered_count(&self) -> usize {
        self.0.lock(|cell| cell.borrow().count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    type Registry = TxRegistry<CriticalSectionRawMutex>;

    #[test]
    fn test_payload_length() {
        assert!(TxPayload::bytes(&[0; 8]).is_ok());
        assert!(matches!(
            TxPayload::bytes(&[0; 9]),
            Err(CanError::InvalidLength(9))
        ));
    }

    #[test]
    fn test_register_validation() {
        let registry = Registry::default();
        let params = TxParams::new(Instance::Can1, 0x800, IdWidth::Standard);
        assert_eq!(
            registry.register(params, 0),
            Err(CanError::InvalidId {
                raw: 0x800,
                width: IdWidth::Standard
            })
        );

        let params = TxParams::new(Instance::Can1, 0x80, IdWidth::Standard);
        let first = registry.register(params, 0).unwrap();
        let params = TxParams::new(Instance::Can1, 0x80, IdWidth::Standard);
        let second = registry.register(params, 0).unwrap();
        assert_ne!(first, second);
        let params = TxParams::new(Instance::Can2, 0x80, IdWidth::Standard);
        assert!(registry.register(params, 0).is_ok());
        assert_eq!(registry.registered_count(), 3);
    }

    #[test]
    fn test_shared_id_independent_periods() {
        let registry = Registry::default();
        let fast = TxParams::new(Instance::Can1, 0x120, IdWidth::Standard)
            .period(10)
            .payload(TxPayload::bytes(&[1]).unwrap());
        let slow = TxParams::new(Instance::Can1, 0x120, IdWidth::Standard)
            .period(30)
            .payload(TxPayload::bytes(&[2]).unwrap());
        registry.register(fast, 0).unwrap();
        let slow = registry.register(slow, 0).unwrap();

        let at_10 = registry.fire_due(10);
        assert_eq!(at_10.len(), 1);
        assert_eq!(at_10[0].as_ref().unwrap().data(), &[1]);
        assert_eq!(registry.fire_due(20).len(), 1);
        let at_30 = registry.fire_due(30);
        assert_eq!(at_30.len(), 2);
        assert!(at_30.iter().all(|f| f.as_ref().unwrap().raw_id() == 0x120));

        registry.unregister(slow).unwrap();
        assert_eq!(registry.fire_due(60).len(), 1);
    }

    #[test]
    fn test_registry_full() {
        let registry = Registry::default();
        for id in 0..MAX_TX_HANDLES as u32 {
            let params = TxParams::new(Instance::Can1, id, IdWidth::Extended);
            registry.register(params, 0).unwrap();
        }
        let params = TxParams::new(Instance::Can1, 0x1000, IdWidth::Extended);
        assert_eq!(registry.register(params, 0), Err(CanError::RegistryFull));
        assert_eq!(registry.registered_count(), MAX_TX_HANDLES);
    }

    #[test]
    fn test_stale_handle() {
        let registry = Registry::default();
        let old = registry
            .register(TxParams::new(Instance::Can1, 0x1, IdWidth::Standard), 0)
            .unwrap();
        registry.unregister(old).unwrap();
        let new = registry
            .register(TxParams::new(Instance::Can1, 0x2, IdWidth::Standard), 0)
            .unwrap();

        assert_eq!(old.index(), new.index());
        assert_eq!(registry.set_period(old, 10), Err(CanError::NotFound));
        assert_eq!(registry.fire(old, 0), Err(CanError::NotFound));
        assert_eq!(registry.unregister(old), Err(CanError::NotFound));
        assert_eq!(registry.fire(new, 0).unwrap().raw_id(), 0x2);
    }

    #[test]
    fn test_stale_handle_after_generation_cycle() {
        let registry = Registry::default();
        let old = registry
            .register(TxParams::new(Instance::Can1, 0x1, IdWidth::Standard), 0)
            .unwrap();
        registry.unregister(old).unwrap();
        for _ in 0..=u16::MAX as u32 {
            let handle = registry
                .register(TxParams::new(Instance::Can1, 0x1, IdWidth::Standard), 0)
                .unwrap();
            registry.unregister(handle).unwrap();
        }
        let new = registry
            .register(TxParams::new(Instance::Can1, 0x2, IdWidth::Standard), 0)
            .unwrap();

        assert_eq!(old.index(), new.index());
        assert_eq!(registry.unregister(old), Err(CanError::NotFound));
        assert_eq!(registry.fire(new, 0).unwrap().raw_id(), 0x2);
    }

    #[test]
    fn test_exhausted_slot_is_retired() {
        let registry = Registry::default();
        registry
            .0
            .lock(|cell| cell.borrow_mut().slots[0].generation = RETIRED - 1);
        let last = registry
            .register(TxParams::new(Instance::Can1, 0x1, IdWidth::Standard), 0)
            .unwrap();
        assert_eq!(last.index(), 0);
        registry.unregister(last).unwrap();

        let next = registry
            .register(TxParams::new(Instance::Can1, 0x2, IdWidth::Standard), 0)
            .unwrap();
        assert_eq!(next.index(), 1);
        assert_eq!(registry.fire(last, 0), Err(CanError::NotFound));
        assert_eq!(registry.registered_count(), 1);
    }

    #[test]
    fn test_fire_due_schedule() {
        let registry = Registry::default();
        let params = TxParams::new(Instance::Can1, 0x300, IdWidth::Standard).period(50);
        registry.register(params, 0).unwrap();
        let manual = TxParams::new(Instance::Can1, 0x301, IdWidth::Standard);
        registry.register(manual, 0).unwrap();

        let fired: std::vec::Vec<u32> = (0..=100)
            .step_by(10)
            .filter(|&now| !registry.fire_due(now).is_empty())
            .collect();
        assert_eq!(fired, vec![50, 100]);
    }

    #[test]
    fn test_fire_due_across_wrap() {
        let registry = Registry::default();
        let params = TxParams::new(Instance::Can1, 0x10, IdWidth::Standard).period(20);
        registry.register(params, u32::MAX - 5).unwrap();

        assert!(registry.fire_due(u32::MAX).is_empty());
        assert_eq!(registry.fire_due(14).len(), 1);
        assert!(registry.fire_due(20).is_empty());
    }

    #[test]
    fn test_packed_payload() {
        let counter = Arc::new(AtomicU8::new(7));
        let source = counter.clone();
        let payload = TxPayload::packed(move |buf| {
            buf[0] = source.fetch_add(1, Ordering::Relaxed);
            // Oversized lengths are clamped
            42
        });
        let registry = Registry::default();
        let handle = registry
            .register(
                TxParams::new(Instance::Can2, 0x400, IdWidth::Standard).payload(payload),
                0,
            )
            .unwrap();

        let frame = registry.fire(handle, 0).unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(frame.data()[0], 7);
        assert_eq!(frame.instance(), Instance::Can2);
        assert_eq!(registry.fire(handle, 0).unwrap().data()[0], 8);
    }

    #[test]
    fn test_update_data_and_frame_with() {
        let registry = Registry::default();
        let payload = TxPayload::bytes(&[1, 2]).unwrap();
        let handle = registry
            .register(
                TxParams::new(Instance::Can1, 0x55, IdWidth::Standard).payload(payload),
                0,
            )
            .unwrap();

        let frame = registry.frame_with(handle, &[9, 9, 9]).unwrap();
        assert_eq!(frame.data(), &[9, 9, 9]);
        assert_eq!(registry.fire(handle, 0).unwrap().data(), &[1, 2]);

        registry.update_data(handle, &[3]).unwrap();
        assert_eq!(registry.fire(handle, 0).unwrap().data(), &[3]);
        assert_eq!(
            registry.update_data(handle, &[0; 9]),
            Err(CanError::InvalidLength(9))
        );
    }
}
