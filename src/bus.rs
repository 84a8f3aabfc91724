//! CAN bus middleware context
//!
//! This module provides [`CanBus`], which owns the registries, handoff queues
//! and diagnostics for one CAN controller pair and exposes the application
//! API together with the interrupt entry points.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embedded_can::Id;
use heapless::Vec;
use log::{debug, trace, warn};

use crate::config::{Config, RxDispatch, TxMode};
use crate::constants::{MAX_RX_HANDLES, RX_QUEUE_CAPACITY, TX_QUEUE_CAPACITY};
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot, Event};
use crate::error::{CanError, HardwareError, Result};
use crate::filter::{apply_plan, FilterPlan};
use crate::frame::{Fifo, Frame, IdWidth, Instance};
use crate::peripheral::{CanPeripheral, Clock, Mailbox, SystemClock};
use crate::queue::HandoffQueue;
use crate::rx::{RxHandle, RxMeta, RxParams, RxRegistry};
use crate::tx::{PeriodicReport, TxHandle, TxParams, TxRegistry};

/// CAN publish/subscribe middleware
///
/// Share it between tasks and interrupt handlers behind an `Arc` or a
/// `static`; every method takes `&self`.
///
/// # Example
///
/// ```
/// use canbus_router::sim::SimPeripheral;
/// use canbus_router::{CanBus, Config, Fifo, IdWidth, Instance, RxParams};
///
/// let bus = CanBus::with_system_clock(Config::default(), SimPeripheral::new());
/// bus.start()?;
///
/// // Subscribe to 0x123
/// bus.register_rx(RxParams::new(Instance::Can1, 0x123, IdWidth::Standard, |frame, _| {
///     println!("RX {}", frame);
/// }))?;
///
/// // Send a frame
/// bus.send(Instance::Can1, 0x321, IdWidth::Standard, &[0x01, 0x02])?;
///
/// // Receive interrupt, then the processing task
/// bus.on_rx_pending(Instance::Can1, Fifo::Fifo0);
/// bus.process_rx();
/// # Ok::<(), canbus_router::CanError>(())
/// ```
pub struct CanBus<P: CanPeripheral, C: Clock = SystemClock> {
    config: Config,
    peripheral: P,
    clock: C,
    /// Whether `start` succeeded and `stop` has not been called since
    started: AtomicBool,
    rx: RxRegistry<CriticalSectionRawMutex>,
    tx: TxRegistry<CriticalSectionRawMutex>,
    rx_queue: HandoffQueue<(Frame, RxMeta), RX_QUEUE_CAPACITY>,
    tx_queue: HandoffQueue<Frame, TX_QUEUE_CAPACITY>,
    diagnostics: Diagnostics,
}

impl<P: CanPeripheral> CanBus<P, SystemClock> {
    /// Create a bus timed by the host clock
    pub fn with_system_clock(config: Config, peripheral: P) -> Self {
        Self::new(config, peripheral, SystemClock::new())
    }
}

impl<P: CanPeripheral, C: Clock> CanBus<P, C> {
    /// Create a stopped bus
    pub fn new(config: Config, peripheral: P, clock: C) -> Self {
        Self {
            config,
            peripheral,
            clock,
            started: AtomicBool::new(false),
            rx: RxRegistry::default(),
            tx: TxRegistry::default(),
            rx_queue: HandoffQueue::new(),
            tx_queue: HandoffQueue::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    /// Configuration the bus was built with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Underlying controller
    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    /// Tick source
    pub fn clock(&self) -> &C {
        &self.clock
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Program the filters of every enabled instance and join the bus
    ///
    /// Registrations made before a `stop` are kept and reprogrammed.
    pub fn start(&self) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CanError::AlreadyStarted);
        }

        if let Err(e) = self.start_instances() {
            for instance in self.enabled_instances() {
                self.peripheral.stop(instance);
            }
            self.started.store(false, Ordering::Release);
            warn!("Start failed: {}", e);
            return Err(e);
        }

        debug!(
            "Started ({:?} RX, {:?} TX)",
            self.config.rx_dispatch, self.config.tx_mode
        );
        Ok(())
    }

    fn start_instances(&self) -> Result<()> {
        for instance in self.enabled_instances() {
            let failed = Cell::new(None);
            let result = self.rx.reconcile(instance, self.config.filter_overflow, |i, plan| {
                self.program_filters(i, plan, &failed)
            });
            self.note_filter_failure(&failed);
            result?;

            self.peripheral.start(instance).map_err(|e| {
                self.diagnostics.record(instance, Event::HardwareError);
                e
            })?;
            debug!("{} on bus", instance);
        }
        Ok(())
    }

    /// Leave the bus and drop every queued frame
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        for instance in self.enabled_instances() {
            self.peripheral.stop(instance);
        }
        self.rx_queue.clear();
        self.tx_queue.clear();
        debug!("Stopped");
    }

    /// Check if the bus has been started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn enabled_instances(&self) -> impl Iterator<Item = Instance> + '_ {
        Instance::ALL
            .into_iter()
            .filter(move |instance| self.config.is_enabled(*instance))
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(CanError::NotInitialized)
        }
    }

    fn ensure_instance(&self, instance: Instance) -> Result<()> {
        self.ensure_started()?;
        if self.config.is_enabled(instance) {
            Ok(())
        } else {
            Err(CanError::InstanceDisabled(instance))
        }
    }

    fn program_filters(
        &self,
        instance: Instance,
        plan: &FilterPlan,
        failed: &Cell<Option<Instance>>,
    ) -> core::result::Result<(), HardwareError> {
        apply_plan(&self.peripheral, instance, plan).map_err(|e| {
            warn!("{}: filter programming failed: {}", instance, e);
            failed.set(Some(instance));
            e
        })
    }

    fn note_filter_failure(&self, failed: &Cell<Option<Instance>>) {
        if let Some(instance) = failed.get() {
            self.diagnostics.record(instance, Event::HardwareError);
        }
    }

    // ------------------------------------------------------------------------
    // RX registration
    // ------------------------------------------------------------------------

    /// Subscribe to frames
    ///
    /// The instance's hardware filters are reprogrammed before this returns.
    pub fn register_rx(&self, params: RxParams) -> Result<RxHandle> {
        self.ensure_instance(params.instance)?;
        let failed = Cell::new(None);
        let result = self.rx.register(params, self.config.filter_overflow, |i, plan| {
            self.program_filters(i, plan, &failed)
        });
        self.note_filter_failure(&failed);
        result
    }

    /// Cancel a subscription
    pub fn unregister_rx(&self, handle: RxHandle) -> Result<()> {
        self.ensure_started()?;
        let failed = Cell::new(None);
        let result = self.rx.unregister(handle, self.config.filter_overflow, |i, plan| {
            self.program_filters(i, plan, &failed)
        });
        self.note_filter_failure(&failed);
        result
    }

    /// Check for a subscription on (instance, id, width)
    pub fn is_rx_registered(&self, instance: Instance, can_id: u32, width: IdWidth) -> bool {
        self.rx.is_registered(instance, can_id, width)
    }

    /// Identifiers subscribed on an instance
    pub fn registered_rx_ids(&self, instance: Instance) -> Vec<Id, MAX_RX_HANDLES> {
        self.rx.registered_ids(instance)
    }

    /// Number of active subscriptions
    pub fn rx_registered_count(&self) -> usize {
        self.rx.registered_count()
    }

    // ------------------------------------------------------------------------
    // TX slots
    // ------------------------------------------------------------------------

    /// Register a TX slot; its period starts now
    pub fn register_tx(&self, params: TxParams) -> Result<TxHandle> {
        self.ensure_instance(params.instance)?;
        self.tx.register(params, self.clock.now_ms())
    }

    /// Release a TX slot
    pub fn unregister_tx(&self, handle: TxHandle) -> Result<()> {
        self.ensure_started()?;
        self.tx.unregister(handle)
    }

    /// Change a slot's period; 0 makes it manual
    pub fn set_period(&self, handle: TxHandle, period_ms: u32) -> Result<()> {
        self.ensure_started()?;
        self.tx.set_period(handle, period_ms)
    }

    /// Replace a slot's payload with `data`
    pub fn update_slot_data(&self, handle: TxHandle, data: &[u8]) -> Result<()> {
        self.ensure_started()?;
        self.tx.update_data(handle, data)
    }

    /// Send a slot's frame now
    ///
    /// Restarts the slot's period.
    pub fn send_slot(&self, handle: TxHandle) -> Result<()> {
        self.ensure_started()?;
        let frame = self.tx.fire(handle, self.clock.now_ms())?;
        self.send_frame(&frame)
    }

    /// Send `data` under a slot's identifier, leaving its payload alone
    pub fn send_slot_with_data(&self, handle: TxHandle, data: &[u8]) -> Result<()> {
        self.ensure_started()?;
        let frame = self.tx.frame_with(handle, data)?;
        self.send_frame(&frame)
    }

    /// Fire every periodic slot that is due at `now_ms`
    ///
    /// Call from a periodic task. A failed slot does not stop the others.
    pub fn process_periodic(&self, now_ms: u32) -> PeriodicReport {
        let mut report = PeriodicReport::default();
        if !self.is_started() {
            return report;
        }

        for due in self.tx.fire_due(now_ms) {
            match due.and_then(|frame| self.send_frame(&frame)) {
                Ok(()) => report.fired += 1,
                Err(e) => {
                    debug!("Periodic send failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Number of active TX slots
    pub fn tx_registered_count(&self) -> usize {
        self.tx.registered_count()
    }

    // ------------------------------------------------------------------------
    // Transmission
    // ------------------------------------------------------------------------

    /// Send a frame using the configured TX mode
    ///
    /// # Arguments
    /// * `instance` - Bus to send on
    /// * `can_id` - Identifier
    /// * `width` - Standard or extended identifier
    /// * `data` - Payload (0-8 bytes)
    pub fn send(&self, instance: Instance, can_id: u32, width: IdWidth, data: &[u8]) -> Result<()> {
        let frame = Frame::new(instance, can_id, width, data)?;
        self.send_frame(&frame)
    }

    /// Send an already built frame using the configured TX mode
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.ensure_instance(frame.instance())?;
        match self.config.tx_mode {
            TxMode::Direct => self.transmit_blocking(frame, self.config.tx_timeout),
            TxMode::Queued => self.enqueue_tx(frame),
        }
    }

    /// Wait up to `timeout` for a free mailbox, whatever the TX mode
    ///
    /// The wait is real time and does not read the bus [`Clock`].
    pub fn send_timeout(
        &self,
        instance: Instance,
        can_id: u32,
        width: IdWidth,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let frame = Frame::new(instance, can_id, width, data)?;
        self.ensure_instance(instance)?;
        self.transmit_blocking(&frame, timeout)
    }

    /// Send from interrupt context; never sleeps
    ///
    /// Uses a free mailbox when there is one. Otherwise the frame is queued in
    /// queued TX mode, or refused with [`CanError::MailboxBusy`] in direct mode.
    pub fn send_from_isr(
        &self,
        instance: Instance,
        can_id: u32,
        width: IdWidth,
        data: &[u8],
    ) -> Result<()> {
        let frame = Frame::new(instance, can_id, width, data)?;
        self.ensure_instance(instance)?;

        if self.peripheral.free_mailboxes(instance) > 0 {
            return self.transmit(&frame);
        }
        match self.config.tx_mode {
            TxMode::Direct => Err(CanError::MailboxBusy),
            TxMode::Queued => self
                .tx_queue
                .try_push(frame)
                .map_err(|frame| self.tx_overflow(&frame)),
        }
    }

    /// Drain the TX queue into the mailboxes
    ///
    /// Each frame waits up to the configured TX timeout; frames that time out
    /// are dropped. Returns the number of frames handed to the hardware.
    pub fn process_tx(&self) -> usize {
        if !self.is_started() {
            return 0;
        }
        let mut sent = 0;
        while let Some(frame) = self.tx_queue.pop() {
            if self.transmit_blocking(&frame, self.config.tx_timeout).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    fn enqueue_tx(&self, frame: &Frame) -> Result<()> {
        self.tx_queue
            .push_timeout(
                *frame,
                self.config.tx_queue_timeout,
                self.config.mailbox_poll_interval,
            )
            .map_err(|frame| self.tx_overflow(&frame))
    }

    fn tx_overflow(&self, frame: &Frame) -> CanError {
        self.diagnostics
            .record(frame.instance(), Event::TxQueueOverflow);
        warn!("TX queue full, dropped {}", frame);
        CanError::QueueFull
    }

    /// Poll for a free mailbox until `timeout` elapses, then hand off
    fn transmit_blocking(&self, frame: &Frame, timeout: Duration) -> Result<()> {
        let instance = frame.instance();
        let deadline = Instant::now() + timeout;

        loop {
            if self.peripheral.free_mailboxes(instance) > 0 {
                return self.transmit(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                self.diagnostics.record(instance, Event::TxTimeout);
                warn!("{}: no free mailbox after {:?}, dropped {}", instance, timeout, frame);
                return Err(CanError::Timeout);
            }
            thread::sleep(self.config.mailbox_poll_interval.min(deadline - now));
        }
    }

    fn transmit(&self, frame: &Frame) -> Result<()> {
        match self.peripheral.add_tx_frame(frame) {
            Ok(Mailbox(index)) => {
                trace!("TX {} (mailbox {})", frame, index);
                Ok(())
            }
            Err(e) => {
                self.diagnostics
                    .record(frame.instance(), Event::HardwareError);
                warn!("{}: transmit rejected: {}", frame.instance(), e);
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reception
    // ------------------------------------------------------------------------

    /// Drain the RX queue and dispatch every frame
    ///
    /// Returns the number of frames taken from the queue.
    pub fn process_rx(&self) -> usize {
        if !self.is_started() {
            return 0;
        }
        let mut count = 0;
        while let Some((frame, meta)) = self.rx_queue.pop() {
            self.dispatch(&frame, &meta);
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for a frame, then drain the RX queue
    pub fn process_rx_timeout(&self, timeout: Duration) -> usize {
        if !self.is_started() {
            return 0;
        }
        match self
            .rx_queue
            .pop_timeout(timeout, self.config.mailbox_poll_interval)
        {
            Some((frame, meta)) => {
                self.dispatch(&frame, &meta);
                1 + self.process_rx()
            }
            None => 0,
        }
    }

    /// Invoke every matching subscription outside the registry lock
    fn dispatch(&self, frame: &Frame, meta: &RxMeta) {
        let callbacks = self.rx.matching(frame);
        if callbacks.is_empty() {
            trace!("RX {} unmatched", frame);
            return;
        }
        trace!("RX {} -> {} subscriber(s)", frame, callbacks.len());
        for callback in &callbacks {
            callback(frame, meta);
        }
    }

    // ------------------------------------------------------------------------
    // Interrupt entry points
    // ------------------------------------------------------------------------

    /// Frame-pending interrupt of a receive FIFO
    ///
    /// Drains the FIFO. In direct dispatch the callbacks run here; otherwise
    /// frames are queued and a full queue drops them.
    pub fn on_rx_pending(&self, instance: Instance, fifo: Fifo) {
        if !self.is_started() || !self.config.is_enabled(instance) {
            return;
        }
        while let Some(frame) = self.peripheral.receive(instance, fifo) {
            let meta = RxMeta {
                timestamp_ms: self.clock.now_ms(),
                fifo,
            };
            match self.config.rx_dispatch {
                RxDispatch::Direct => self.dispatch(&frame, &meta),
                RxDispatch::Queued => {
                    if self.rx_queue.try_push((frame, meta)).is_err() {
                        self.diagnostics.record(instance, Event::RxQueueOverflow);
                        warn!("RX queue full, dropped {}", frame);
                    }
                }
            }
        }
    }

    /// Mailbox transmission-complete interrupt
    pub fn on_tx_complete(&self, instance: Instance, mailbox: Mailbox) {
        if !self.is_started() {
            return;
        }
        self.diagnostics.record(instance, Event::TxComplete);
        trace!("{}: mailbox {} complete", instance, mailbox.0);
    }

    /// Bus error interrupt
    pub fn on_bus_error(&self, instance: Instance, code: u32) {
        if !self.is_started() {
            return;
        }
        self.diagnostics.record(instance, Event::HardwareError);
        warn!("{}: {}", instance, HardwareError::Bus(code));
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    /// Empty transmit mailboxes; 0 when stopped or disabled
    pub fn free_mailboxes(&self, instance: Instance) -> u8 {
        if self.ensure_instance(instance).is_err() {
            return 0;
        }
        self.peripheral.free_mailboxes(instance)
    }

    /// Check if a send on `instance` would find a mailbox right away
    pub fn is_tx_ready(&self, instance: Instance) -> bool {
        self.free_mailboxes(instance) > 0
    }

    /// Frames waiting in the TX queue
    pub fn tx_queue_pending(&self) -> usize {
        self.tx_queue.len()
    }

    /// Frames waiting in the RX queue
    pub fn rx_queue_pending(&self) -> usize {
        self.rx_queue.len()
    }

    /// Counters of one instance
    pub fn diagnostics(&self, instance: Instance) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot(instance)
    }

    /// Counters summed over both instances
    pub fn diagnostics_total(&self) -> DiagnosticsSnapshot {
        self.diagnostics.total()
    }

    /// Clear every counter
    pub fn reset_diagnostics(&self) {
        self.diagnostics.reset();
    }
}

impl<P: CanPeripheral, C: Clock> std::fmt::Debug for CanBus<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanBus")
            .field("started", &self.is_started())
            .field("config", &self.config)
            .field("rx_registered", &self.rx.registered_count())
            .field("tx_registered", &self.tx.registered_count())
            .field("rx_pending", &self.rx_queue.len())
            .field("tx_pending", &self.tx_queue.len())
            .finish()
    }
}

impl<P: CanPeripheral, C: Clock> Drop for CanBus<P, C> {
    fn drop(&mut self) {
        self.stop();
    }
}
