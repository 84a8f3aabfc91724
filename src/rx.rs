//! RX subscription registry
//!
//! A fixed table of subscription slots. Slots are allocated first-fit and carry
//! a generation that is bumped whenever the slot is released, so a handle that
//! outlived its registration can never address the slot's next occupant.
//!
//! Every change recomputes the instance's filter plan and hands it to the
//! caller-supplied `apply` function while the table is still locked, so the
//! hardware filters and the table never disagree once the call returns.

use core::cell::RefCell;
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_can::Id;
use heapless::Vec;
use log::debug;

use crate::config::FilterOverflowPolicy;
use crate::constants::MAX_RX_HANDLES;
use crate::error::{CanError, HardwareError, Result};
use crate::filter::{plan_filters, FilterPlan, FilterRequest, MatchMode};
use crate::frame::{Fifo, Frame, IdWidth, Instance};

/// Callback invoked for every matching frame
pub type RxCallback = Arc<dyn Fn(&Frame, &RxMeta) + Send + Sync>;

/// Callbacks collected for one frame
pub(crate) type Matches = Vec<RxCallback, MAX_RX_HANDLES>;

/// Reception details passed alongside a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxMeta {
    /// Tick at which the frame was taken from the hardware FIFO
    pub timestamp_ms: u32,
    /// FIFO the frame arrived on
    pub fifo: Fifo,
}

/// RX registration parameters
#[derive(Clone)]
pub struct RxParams {
    /// Instance to receive on
    pub instance: Instance,
    /// Identifier to match
    pub can_id: u32,
    /// Standard or extended identifier
    pub width: IdWidth,
    /// Exact, masked or wildcard
    pub mode: MatchMode,
    /// FIFO the filter bank routes into
    pub fifo: Fifo,
    /// Callback invoked on match
    pub callback: RxCallback,
}

impl RxParams {
    /// Exact-match subscription on FIFO 0
    ///
    /// # Example
    /// ```
    /// use canbus_router::{IdWidth, Instance, RxParams};
    ///
    /// let params = RxParams::new(Instance::Can1, 0x100, IdWidth::Standard, |frame, _meta| {
    ///     println!("RX {}", frame);
    /// })
    /// .masked(0x700);
    /// ```
    pub fn new<F>(instance: Instance, can_id: u32, width: IdWidth, callback: F) -> Self
    where
        F: Fn(&Frame, &RxMeta) + Send + Sync + 'static,
    {
        Self {
            instance,
            can_id,
            width,
            mode: MatchMode::Exact,
            fifo: Fifo::Fifo0,
            callback: Arc::new(callback),
        }
    }

    /// Match a range of identifiers through `mask`
    pub fn masked(mut self, mask: u32) -> Self {
        self.mode = MatchMode::Masked(mask);
        self
    }

    /// Match every frame on the instance
    pub fn wildcard(mut self) -> Self {
        self.mode = MatchMode::Wildcard;
        self
    }

    /// Route through the given FIFO
    pub fn fifo(mut self, fifo: Fifo) -> Self {
        self.fifo = fifo;
        self
    }
}

impl std::fmt::Debug for RxParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxParams")
            .field("instance", &self.instance)
            .field("can_id", &format_args!("0x{:X}", self.can_id))
            .field("width", &self.width)
            .field("mode", &self.mode)
            .field("fifo", &self.fifo)
            .finish_non_exhaustive()
    }
}

/// Handle to an RX registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RxHandle {
    index: u16,
    generation: u32,
}

impl RxHandle {
    /// Slot index inside the registry
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

struct Entry {
    instance: Instance,
    can_id: u32,
    width: IdWidth,
    mode: MatchMode,
    fifo: Fifo,
    callback: RxCallback,
}

impl Entry {
    fn request(&self) -> FilterRequest {
        FilterRequest {
            raw_id: self.can_id,
            width: self.width,
            mode: self.mode,
            fifo: self.fifo,
        }
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
    slots: [Slot; MAX_RX_HANDLES],
    count: usize,
}

impl Inner {
    fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::default()),
            count: 0,
        }
    }

    fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }

    fn find(&self, instance: Instance, can_id: u32, width: IdWidth) -> bool {
        self.entries()
            .any(|e| e.instance == instance && e.can_id == can_id && e.width == width)
    }

    fn plan(
        &self,
        instance: Instance,
        extra: Option<FilterRequest>,
        policy: FilterOverflowPolicy,
    ) -> Result<FilterPlan> {
        let requests = self
            .entries()
            .filter(|e| e.instance == instance)
            .map(Entry::request)
            .chain(extra);
        plan_filters(instance, requests, policy)
    }

    fn slot_mut(&mut self, handle: RxHandle) -> Result<&mut Slot> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(CanError::NotFound)?;
        if slot.generation != handle.generation || slot.entry.is_none() {
            return Err(CanError::NotFound);
        }
        Ok(slot)
    }

    fn release(&mut self, index: usize) -> Option<Entry> {
        let slot = &mut self.slots[index];
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.saturating_add(1);
        self.count -= 1;
        Some(entry)
    }
}

/// RX subscription table
pub(crate) struct RxRegistry<M: RawMutex>(Mutex<M, RefCell<Inner>>);

impl<M: RawMutex> Default for RxRegistry<M> {
    fn default() -> Self {
        Self(Mutex::new(RefCell::new(Inner::new())))
    }
}

impl<M: RawMutex> RxRegistry<M> {
    /// Add a subscription and reprogram the instance's filters
    pub fn register<A>(
        &self,
        params: RxParams,
        policy: FilterOverflowPolicy,
        apply: A,
    ) -> Result<RxHandle>
    where
        A: Fn(Instance, &FilterPlan) -> core::result::Result<(), HardwareError>,
    {
        params.width.validate(params.can_id)?;

        self.0.lock(|cell| {
            let mut inner = cell.borrow_mut();

            if inner.find(params.instance, params.can_id, params.width) {
                return Err(CanError::AlreadyRegistered);
            }

            let index = inner
                .slots
                .iter()
                .position(Slot::is_free)
                .ok_or(CanError::RegistryFull)?;

            let entry = Entry {
                instance: params.instance,
                can_id: params.can_id,
                width: params.width,
                mode: params.mode,
                fifo: params.fifo,
                callback: params.callback,
            };
            let plan = inner.plan(params.instance, Some(entry.request()), policy)?;

            inner.slots[index].entry = Some(entry);
            inner.count += 1;

            if let Err(e) = apply(params.instance, &plan) {
                inner.release(index);
                if let Ok(previous) = inner.plan(params.instance, None, policy) {
                    let _ = apply(params.instance, &previous);
                }
                return Err(e.into());
            }

            debug!(
                "RX register {} id=0x{:X} {:?} {:?} -> slot {}",
                params.instance, params.can_id, params.width, params.mode, index
            );
            Ok(RxHandle {
                index: index as u16,
                generation: inner.slots[index].generation,
            })
        })
    }

    /// Remove a subscription and reprogram the instance's filters
    ///
    /// The subscription is gone even when reprogramming fails.
    pub fn unregister<A>(
        &self,
        handle: RxHandle,
        policy: FilterOverflowPolicy,
        apply: A,
    ) -> Result<()>
    where
        A: Fn(Instance, &FilterPlan) -> core::result::Result<(), HardwareError>,
    {
        self.0.lock(|cell| {
            let mut inner = cell.borrow_mut();

            inner.slot_mut(handle)?;
            let entry = inner.release(handle.index()).ok_or(CanError::NotFound)?;
            debug!(
                "RX unregister {} id=0x{:X} (slot {})",
                entry.instance,
                entry.can_id,
                handle.index()
            );

            let plan = inner.plan(entry.instance, None, policy)?;
            apply(entry.instance, &plan)?;
            Ok(())
        })
    }

    /// Reprogram an instance from the current table
    pub fn reconcile<A>(
        &self,
        instance: Instance,
        policy: FilterOverflowPolicy,
        apply: A,
    ) -> Result<()>
    where
        A: Fn(Instance, &FilterPlan) -> core::result::Result<(), HardwareError>,
    {
        self.0.lock(|cell| {
            let inner = cell.borrow();
            let plan = inner.plan(instance, None, policy)?;
            apply(instance, &plan)?;
            Ok(())
        })
    }

    /// Check for an active subscription on (instance, id, width)
    pub fn is_registered(&self, instance: Instance, can_id: u32, width: IdWidth) -> bool {
        self.0
            .lock(|cell| cell.borrow().find(instance, can_id, width))
    }

    /// Identifiers subscribed on an instance, in slot order
    pub fn registered_ids(&self, instance: Instance) -> Vec<Id, MAX_RX_HANDLES> {
        self.0.lock(|cell| {
            cell.borrow()
                .entries()
                .filter(|e| e.instance == instance)
                .filter_map(|e| e.width.id(e.can_id).ok())
                .collect()
        })
    }

    /// Number of active subscriptions
    pub fn registered_count(&self) -> usize {
        self.0.lock(|cell| cell.borrow().count)
    }

    /// Callbacks of every subscription matching `frame`
    ///
    /// The callbacks are returned rather than invoked so that they run after
    /// the table lock is released.
    pub fn matching(&self, frame: &Frame) -> Matches {
        self.0.lock(|cell| {
            let inner = cell.borrow();
            let mut matches = Matches::new();
            for entry in inner.entries() {
                if entry.instance == frame.instance()
                    && entry.mode.matches(entry.can_id, entry.width, frame)
                {
                    // At most MAX_RX_HANDLES entries exist
                    let _ = matches.push(entry.callback.clone());
                }
            }
            matches
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterBank;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Registry = RxRegistry<CriticalSectionRawMutex>;

    type ApplyResult = core::result::Result<(), HardwareError>;

    const POLICY: FilterOverflowPolicy = FilterOverflowPolicy::Reject;

    fn ok(_: Instance, _: &FilterPlan) -> ApplyResult {
        Ok(())
    }

    fn params(instance: Instance, can_id: u32) -> RxParams {
        RxParams::new(instance, can_id, IdWidth::Standard, |_, _| {})
    }

    #[test]
    fn test_register_and_duplicate() {
        let registry = Registry::default();
        let handle = registry.register(params(Instance::Can1, 0x123), POLICY, ok).unwrap();

        assert!(registry.is_registered(Instance::Can1, 0x123, IdWidth::Standard));
        assert!(!registry.is_registered(Instance::Can1, 0x123, IdWidth::Extended));
        assert!(!registry.is_registered(Instance::Can2, 0x123, IdWidth::Standard));

        let masked = params(Instance::Can1, 0x123).masked(0x700);
        assert_eq!(
            registry.register(masked, POLICY, ok),
            Err(CanError::AlreadyRegistered)
        );
        assert_eq!(registry.registered_count(), 1);

        // Same identifier, other width, is a different tuple
        let ext = RxParams::new(Instance::Can1, 0x123, IdWidth::Extended, |_, _| {});
        let ext_handle = registry.register(ext, POLICY, ok).unwrap();
        assert_ne!(ext_handle, handle);
    }

    #[test]
    fn test_invalid_identifier() {
        let registry = Registry::default();
        assert_eq!(
            registry.register(params(Instance::Can1, 0x800), POLICY, ok),
            Err(CanError::InvalidId {
                raw: 0x800,
                width: IdWidth::Standard
            })
        );
        assert_eq!(registry.registered_count(), 0);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let registry = Registry::default();
        let old = registry.register(params(Instance::Can1, 0x10), POLICY, ok).unwrap();
        registry.unregister(old, POLICY, ok).unwrap();
        assert!(!registry.is_registered(Instance::Can1, 0x10, IdWidth::Standard));

        let new = registry.register(params(Instance::Can1, 0x20), POLICY, ok).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);

        assert_eq!(registry.unregister(old, POLICY, ok), Err(CanError::NotFound));
        assert!(registry.is_registered(Instance::Can1, 0x20, IdWidth::Standard));
    }

    #[test]
    fn test_stale_handle_after_generation_cycle() {
        let registry = Registry::default();
        let old = registry.register(params(Instance::Can1, 0x10), POLICY, ok).unwrap();
        registry.unregister(old, POLICY, ok).unwrap();
        for _ in 0..=u16::MAX as u32 {
            let handle = registry.register(params(Instance::Can1, 0x10), POLICY, ok).unwrap();
            registry.unregister(handle, POLICY, ok).unwrap();
        }
        let new = registry.register(params(Instance::Can1, 0x20), POLICY, ok).unwrap();

        assert_eq!(new.index(), old.index());
        assert_eq!(registry.unregister(old, POLICY, ok), Err(CanError::NotFound));
        assert!(registry.is_registered(Instance::Can1, 0x20, IdWidth::Standard));
    }

    #[test]
    fn test_exhausted_slot_is_retired() {
        let registry = Registry::default();
        registry
            .0
            .lock(|cell| cell.borrow_mut().slots[0].generation = RETIRED - 1);
        let last = registry.register(params(Instance::Can1, 0x10), POLICY, ok).unwrap();
        assert_eq!(last.index(), 0);
        registry.unregister(last, POLICY, ok).unwrap();

        let next = registry.register(params(Instance::Can1, 0x20), POLICY, ok).unwrap();
        assert_eq!(next.index(), 1);
        assert_eq!(registry.unregister(last, POLICY, ok), Err(CanError::NotFound));
        assert!(registry.is_registered(Instance::Can1, 0x20, IdWidth::Standard));
    }

    #[test]
    fn test_registry_full() {
        let registry = Registry::default();
        // Spread over both instances to stay inside the filter quotas
        for i in 0..MAX_RX_HANDLES as u32 {
            let instance = if i % 2 == 0 { Instance::Can1 } else { Instance::Can2 };
            let p = params(instance, i).wildcard();
            registry.register(p, POLICY, ok).unwrap();
        }
        assert_eq!(
            registry.register(params(Instance::Can1, 0x700), POLICY, ok),
            Err(CanError::RegistryFull)
        );
        assert_eq!(registry.registered_count(), MAX_RX_HANDLES);
        assert!(registry.is_registered(Instance::Can1, 0, IdWidth::Standard));
    }

    #[test]
    fn test_apply_receives_plan() {
        let registry = Registry::default();
        let calls = AtomicUsize::new(0);
        let apply = |instance: Instance, plan: &FilterPlan| -> ApplyResult {
            calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(instance, Instance::Can2);
            assert_eq!(plan.len(), 1);
            Ok(())
        };

        let handle = registry.register(params(Instance::Can2, 0x55), POLICY, apply).unwrap();
        registry
            .unregister(handle, POLICY, |_, plan: &FilterPlan| {
                assert_eq!(plan.as_slice(), &[FilterBank::RejectAll]);
                Ok(())
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hardware_failure_rolls_back() {
        let registry = Registry::default();
        let result = registry.register(params(Instance::Can1, 0x42), POLICY, |_, _| {
            Err(HardwareError::Rejected)
        });
        assert_eq!(result, Err(CanError::Hardware(HardwareError::Rejected)));
        assert!(!registry.is_registered(Instance::Can1, 0x42, IdWidth::Standard));
        assert_eq!(registry.registered_count(), 0);
    }

    #[test]
    fn test_matching_and_ids() {
        let registry = Registry::default();
        registry.register(params(Instance::Can1, 0x100).masked(0x700), POLICY, ok).unwrap();
        registry.register(params(Instance::Can1, 0x1F0), POLICY, ok).unwrap();
        registry.register(params(Instance::Can2, 0x1F0), POLICY, ok).unwrap();

        let frame = Frame::new(Instance::Can1, 0x1F0, IdWidth::Standard, &[]).unwrap();
        assert_eq!(registry.matching(&frame).len(), 2);

        let frame = Frame::new(Instance::Can1, 0x200, IdWidth::Standard, &[]).unwrap();
        assert!(registry.matching(&frame).is_empty());

        let ids = registry.registered_ids(Instance::Can1);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], IdWidth::Standard.id(0x100).unwrap());
    }
}
