//! Software CAN controller
//!
//! [`SimPeripheral`] behaves like a dual bxCAN cell closely enough to drive the
//! middleware on a host: 28 shared filter banks evaluated on every received
//! frame, 3 transmit mailboxes and two 3-deep receive FIFOs per instance.
//!
//! By default a frame placed in a mailbox is transmitted at once. Turning
//! auto-completion off keeps frames in their mailboxes until
//! [`complete_mailboxes`](SimPeripheral::complete_mailboxes) is called, and
//! [`set_stuck`](SimPeripheral::set_stuck) makes an instance report no free
//! mailbox at all.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::trace;

use crate::constants::{INSTANCE_COUNT, RX_FIFO_COUNT, TOTAL_FILTER_BANKS, TX_MAILBOX_COUNT};
use crate::error::HardwareError;
use crate::filter::FilterBank;
use crate::frame::{Fifo, Frame, Instance};
use crate::peripheral::{CanPeripheral, Mailbox};

/// Frames a hardware receive FIFO holds
pub const SIM_FIFO_DEPTH: usize = 3;

#[derive(Debug, Default)]
struct Controller {
    started: bool,
    stuck: bool,
    mailboxes: [Option<Frame>; TX_MAILBOX_COUNT as usize],
    fifos: [VecDeque<Frame>; RX_FIFO_COUNT],
    overruns: [u32; RX_FIFO_COUNT],
}

#[derive(Debug)]
struct State {
    banks: [FilterBank; TOTAL_FILTER_BANKS as usize],
    controllers: [Controller; INSTANCE_COUNT],
    transmitted: Vec<Frame>,
    auto_complete: bool,
    loopback: bool,
    reject_tx: bool,
    reject_filters: bool,
}

impl State {
    /// Run the instance's filter banks over a frame and store it
    fn deliver(&mut self, frame: Frame) -> Option<Fifo> {
        let instance = frame.instance();
        let controller = &self.controllers[instance.index()];
        if !controller.started {
            return None;
        }

        let fifo = instance
            .filter_banks()
            .map(|bank| self.banks[bank as usize])
            .find(|bank| bank.accepts(&frame))?
            .fifo();

        let controller = &mut self.controllers[instance.index()];
        let queue = &mut controller.fifos[fifo.index()];
        if queue.len() >= SIM_FIFO_DEPTH {
            controller.overruns[fifo.index()] += 1;
            trace!("{} {:?} overrun, dropped {}", instance, fifo, frame);
            return None;
        }
        queue.push_back(frame);
        Some(fifo)
    }

    fn complete(&mut self, frame: Frame) {
        trace!("SIM TX {}", frame);
        self.transmitted.push(frame);
        if self.loopback {
            self.deliver(frame);
        }
    }
}

/// Simulated dual CAN controller
#[derive(Debug)]
pub struct SimPeripheral {
    state: Mutex<State>,
}

impl Default for SimPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPeripheral {
    /// Create a stopped controller with every filter bank disabled
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                banks: [FilterBank::Disabled; TOTAL_FILTER_BANKS as usize],
                controllers: Default::default(),
                transmitted: Vec::new(),
                auto_complete: true,
                loopback: false,
                reject_tx: false,
                reject_filters: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A frame arrives from the bus
    ///
    /// Returns the FIFO it was stored in, or `None` when the instance is
    /// stopped, no bank accepts it, or the FIFO overran.
    pub fn inject(&self, frame: Frame) -> Option<Fifo> {
        self.state().deliver(frame)
    }

    /// Transmit every frame waiting in an instance's mailboxes
    ///
    /// Does nothing while the instance is stuck.
    pub fn complete_mailboxes(&self, instance: Instance) -> Vec<Frame> {
        let mut state = self.state();
        let controller = &mut state.controllers[instance.index()];
        if controller.stuck {
            return Vec::new();
        }
        let done: Vec<Frame> = controller
            .mailboxes
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        for frame in &done {
            state.complete(*frame);
        }
        done
    }

    /// Transmit frames immediately on `add_tx_frame` (default on)
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state().auto_complete = enabled;
    }

    /// Report no free mailbox on `instance`
    pub fn set_stuck(&self, instance: Instance, stuck: bool) {
        self.state().controllers[instance.index()].stuck = stuck;
    }

    /// Feed transmitted frames back into the receiving side of their instance
    pub fn set_loopback(&self, enabled: bool) {
        self.state().loopback = enabled;
    }

    /// Refuse every transmit request
    pub fn set_reject_tx(&self, reject: bool) {
        self.state().reject_tx = reject;
    }

    /// Refuse every filter configuration request
    pub fn set_reject_filters(&self, reject: bool) {
        self.state().reject_filters = reject;
    }

    /// Frames transmitted so far, oldest first
    pub fn transmitted(&self) -> Vec<Frame> {
        self.state().transmitted.clone()
    }

    /// Drain the transmitted log
    pub fn take_transmitted(&self) -> Vec<Frame> {
        std::mem::take(&mut self.state().transmitted)
    }

    /// Current configuration of a global filter bank
    pub fn filter(&self, bank: u8) -> FilterBank {
        self.state()
            .banks
            .get(bank as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Check whether any bank of `instance` accepts `frame`
    pub fn accepts(&self, frame: &Frame) -> bool {
        let state = self.state();
        frame
            .instance()
            .filter_banks()
            .any(|bank| state.banks[bank as usize].accepts(frame))
    }

    /// Frames waiting in a receive FIFO
    pub fn pending(&self, instance: Instance, fifo: Fifo) -> usize {
        self.state().controllers[instance.index()].fifos[fifo.index()].len()
    }

    /// Frames lost to a full receive FIFO
    pub fn overruns(&self, instance: Instance, fifo: Fifo) -> u32 {
        self.state().controllers[instance.index()].overruns[fifo.index()]
    }

    /// Check if an instance is on the bus
    pub fn is_started(&self, instance: Instance) -> bool {
        self.state().controllers[instance.index()].started
    }
}

impl CanPeripheral for SimPeripheral {
    fn start(&self, instance: Instance) -> Result<(), HardwareError> {
        self.state().controllers[instance.index()].started = true;
        Ok(())
    }

    fn stop(&self, instance: Instance) {
        let mut state = self.state();
        let controller = &mut state.controllers[instance.index()];
        controller.started = false;
        controller.mailboxes = Default::default();
        controller.fifos.iter_mut().for_each(VecDeque::clear);
    }

    fn configure_filter(&self, bank: u8, filter: &FilterBank) -> Result<(), HardwareError> {
        let mut state = self.state();
        if state.reject_filters {
            return Err(HardwareError::Rejected);
        }
        let slot = state
            .banks
            .get_mut(bank as usize)
            .ok_or(HardwareError::Rejected)?;
        *slot = *filter;
        Ok(())
    }

    fn free_mailboxes(&self, instance: Instance) -> u8 {
        let state = self.state();
        let controller = &state.controllers[instance.index()];
        if controller.stuck {
            return 0;
        }
        controller.mailboxes.iter().filter(|m| m.is_none()).count() as u8
    }

    fn add_tx_frame(&self, frame: &Frame) -> Result<Mailbox, HardwareError> {
        let mut state = self.state();
        if state.reject_tx {
            return Err(HardwareError::Rejected);
        }
        let auto_complete = state.auto_complete;
        let controller = &mut state.controllers[frame.instance().index()];
        if !controller.started || controller.stuck {
            return Err(HardwareError::NotReady);
        }
        let index = controller
            .mailboxes
            .iter()
            .position(Option::is_none)
            .ok_or(HardwareError::NotReady)?;

        if auto_complete {
            state.complete(*frame);
        } else {
            controller.mailboxes[index] = Some(*frame);
        }
        Ok(Mailbox(index as u8))
    }

    fn receive(&self, instance: Instance, fifo: Fifo) -> Option<Frame> {
        self.state().controllers[instance.index()].fifos[fifo.index()].pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::IdWidth;

    fn frame(instance: Instance, id: u32) -> Frame {
        Frame::new(instance, id, IdWidth::Standard, &[0xAA]).unwrap()
    }

    fn started() -> SimPeripheral {
        let sim = SimPeripheral::new();
        sim.start(Instance::Can1).unwrap();
        sim.start(Instance::Can2).unwrap();
        sim
    }

    #[test]
    fn test_disabled_banks_accept_nothing() {
        let sim = started();
        assert_eq!(sim.inject(frame(Instance::Can1, 0x100)), None);
    }

    #[test]
    fn test_filter_routes_to_fifo() {
        let sim = started();
        let bank = FilterBank::IdMask {
            id: 0x100,
            mask: 0x7FF,
            width: IdWidth::Standard,
            fifo: Fifo::Fifo1,
        };
        sim.configure_filter(14, &bank).unwrap();

        // Bank 14 belongs to CAN2 only
        assert_eq!(sim.inject(frame(Instance::Can1, 0x100)), None);
        assert_eq!(sim.inject(frame(Instance::Can2, 0x100)), Some(Fifo::Fifo1));
        assert_eq!(sim.inject(frame(Instance::Can2, 0x101)), None);
        assert_eq!(sim.pending(Instance::Can2, Fifo::Fifo1), 1);
        assert_eq!(sim.receive(Instance::Can2, Fifo::Fifo1), Some(frame(Instance::Can2, 0x100)));
    }

    #[test]
    fn test_fifo_overrun() {
        let sim = started();
        sim.configure_filter(0, &FilterBank::accept_all(Fifo::Fifo0)).unwrap();
        for _ in 0..SIM_FIFO_DEPTH {
            assert!(sim.inject(frame(Instance::Can1, 1)).is_some());
        }
        assert_eq!(sim.inject(frame(Instance::Can1, 1)), None);
        assert_eq!(sim.overruns(Instance::Can1, Fifo::Fifo0), 1);
    }

    #[test]
    fn test_mailboxes_hold_until_completed() {
        let sim = started();
        sim.set_auto_complete(false);
        for _ in 0..TX_MAILBOX_COUNT {
            sim.add_tx_frame(&frame(Instance::Can1, 0x10)).unwrap();
        }
        assert_eq!(sim.free_mailboxes(Instance::Can1), 0);
        assert_eq!(
            sim.add_tx_frame(&frame(Instance::Can1, 0x10)),
            Err(HardwareError::NotReady)
        );
        assert!(sim.transmitted().is_empty());

        assert_eq!(sim.complete_mailboxes(Instance::Can1).len(), 3);
        assert_eq!(sim.free_mailboxes(Instance::Can1), 3);
        assert_eq!(sim.take_transmitted().len(), 3);
        assert!(sim.transmitted().is_empty());
    }

    #[test]
    fn test_stuck_and_reject() {
        let sim = started();
        sim.set_stuck(Instance::Can1, true);
        assert_eq!(sim.free_mailboxes(Instance::Can1), 0);
        assert_eq!(sim.free_mailboxes(Instance::Can2), 3);

        sim.set_reject_tx(true);
        assert_eq!(
            sim.add_tx_frame(&frame(Instance::Can2, 0x10)),
            Err(HardwareError::Rejected)
        );
    }

    #[test]
    fn test_loopback() {
        let sim = started();
        sim.set_loopback(true);
        sim.configure_filter(0, &FilterBank::accept_all(Fifo::Fifo0)).unwrap();
        sim.add_tx_frame(&frame(Instance::Can1, 0x123)).unwrap();
        assert_eq!(sim.receive(Instance::Can1, Fifo::Fifo0), Some(frame(Instance::Can1, 0x123)));
    }

    #[test]
    fn test_stop_clears_state() {
        let sim = started();
        sim.configure_filter(0, &FilterBank::accept_all(Fifo::Fifo0)).unwrap();
        sim.inject(frame(Instance::Can1, 0x1));
        sim.stop(Instance::Can1);
        assert!(!sim.is_started(Instance::Can1));
        assert_eq!(sim.pending(Instance::Can1, Fifo::Fifo0), 0);
        assert_eq!(sim.inject(frame(Instance::Can1, 0x1)), None);
    }
}
