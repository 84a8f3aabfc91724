//! Receive filtering
//!
//! Hardware filter banks are derived from the active RX subscriptions of an
//! instance: one bank per identifier, a single accept-all bank when a wildcard
//! subscription exists, and a reject-all bank when nothing is subscribed.
//! The same [`MatchMode`] rules are applied again in software when frames are
//! dispatched, because hardware filtering is not trusted to be exact.

use heapless::Vec;
use log::{debug, warn};

use crate::config::FilterOverflowPolicy;
use crate::constants::FILTER_BANKS_PER_INSTANCE;
use crate::error::{CanError, HardwareError, Result};
use crate::frame::{Fifo, Frame, IdWidth, Instance};
use crate::peripheral::CanPeripheral;

/// Identifier extension bit in the 32-bit filter register layout
const IDE_BIT: u32 = 1 << 2;
/// Reserved bit 0 of the register layout; received frames always read 0 here
const RESERVED_BIT: u32 = 1 << 0;

/// How a subscription compares incoming identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Identical identifier and width
    Exact,
    /// Same width and `(rx & mask) == (registered & mask)`
    Masked(u32),
    /// Every frame on the instance
    Wildcard,
}

impl MatchMode {
    /// Software match of a received frame against a registered identifier
    pub fn matches(self, raw_id: u32, width: IdWidth, frame: &Frame) -> bool {
        match self {
            MatchMode::Exact => frame.width() == width && frame.raw_id() == raw_id,
            MatchMode::Masked(mask) => {
                frame.width() == width && (frame.raw_id() & mask) == (raw_id & mask)
            }
            MatchMode::Wildcard => true,
        }
    }
}

/// Configuration of one hardware filter bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterBank {
    /// Bank is switched off
    #[default]
    Disabled,
    /// Bank enabled but matching no frame at all
    RejectAll,
    /// Identifier/mask comparison; mask bits set to 1 must match
    IdMask {
        /// Identifier to compare against
        id: u32,
        /// Comparison mask
        mask: u32,
        /// Identifier width the bank is programmed for
        width: IdWidth,
        /// FIFO accepted frames are routed into
        fifo: Fifo,
    },
}

impl FilterBank {
    /// Bank accepting every frame into `fifo`
    pub fn accept_all(fifo: Fifo) -> Self {
        FilterBank::IdMask {
            id: 0,
            mask: 0,
            width: IdWidth::Standard,
            fifo,
        }
    }

    /// Check if the bank takes part in filtering
    pub fn is_enabled(&self) -> bool {
        !matches!(self, FilterBank::Disabled)
    }

    /// FIFO the bank routes into
    pub fn fifo(&self) -> Fifo {
        match self {
            FilterBank::IdMask { fifo, .. } => *fifo,
            _ => Fifo::Fifo0,
        }
    }

    /// Identifier and mask registers in the 32-bit scale layout
    ///
    /// Standard identifiers occupy bits 31..21, extended identifiers bits
    /// 31..3, bit 2 is IDE. Returns `None` for a disabled bank.
    pub fn registers(&self) -> Option<(u32, u32)> {
        match *self {
            FilterBank::Disabled => None,
            FilterBank::RejectAll => Some((RESERVED_BIT, RESERVED_BIT)),
            // Nothing compared, not even IDE
            FilterBank::IdMask { mask: 0, .. } => Some((0, 0)),
            FilterBank::IdMask {
                id,
                mask,
                width: IdWidth::Standard,
                ..
            } => Some((id << 21, (mask << 21) | IDE_BIT)),
            FilterBank::IdMask {
                id,
                mask,
                width: IdWidth::Extended,
                ..
            } => Some(((id << 3) | IDE_BIT, (mask << 3) | IDE_BIT)),
        }
    }

    /// Hardware acceptance decision for a frame
    pub fn accepts(&self, frame: &Frame) -> bool {
        match self.registers() {
            Some((id, mask)) => (frame_register(frame) ^ id) & mask == 0,
            None => false,
        }
    }
}

/// Received frame identifier in the filter register layout
pub(crate) fn frame_register(frame: &Frame) -> u32 {
    match frame.width() {
        IdWidth::Standard => frame.raw_id() << 21,
        IdWidth::Extended => (frame.raw_id() << 3) | IDE_BIT,
    }
}

/// One subscription's demand on the filter banks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterRequest {
    /// Registered identifier
    pub raw_id: u32,
    /// Registered width
    pub width: IdWidth,
    /// Match mode of the subscription
    pub mode: MatchMode,
    /// Requested FIFO
    pub fifo: Fifo,
}

/// Enabled banks for one instance, in bank order
pub type FilterPlan = Vec<FilterBank, FILTER_BANKS_PER_INSTANCE>;

/// Compute the bank layout for an instance
///
/// Banks not present in the returned plan are to be disabled.
///
/// # Arguments
/// * `instance` - Instance whose quota is being planned
/// * `requests` - Active subscriptions of the instance, in slot order
/// * `policy` - Behaviour when the quota is exceeded
pub fn plan_filters<I>(
    instance: Instance,
    requests: I,
    policy: FilterOverflowPolicy,
) -> Result<FilterPlan>
where
    I: IntoIterator<Item = FilterRequest>,
{
    let mut banks = FilterPlan::new();
    let mut wildcard_fifo = None;
    let mut needed = 0usize;

    for request in requests {
        let bank = match request.mode {
            MatchMode::Wildcard => {
                wildcard_fifo.get_or_insert(request.fifo);
                continue;
            }
            MatchMode::Exact => FilterBank::IdMask {
                id: request.raw_id,
                mask: request.width.max_id(),
                width: request.width,
                fifo: request.fifo,
            },
            MatchMode::Masked(mask) => FilterBank::IdMask {
                id: request.raw_id & mask & request.width.max_id(),
                mask: mask & request.width.max_id(),
                width: request.width,
                fifo: request.fifo,
            },
        };
        needed += 1;
        // Overflow is detected through `needed`; the bank is simply not kept
        let _ = banks.push(bank);
    }

    // The quota holds with or without a wildcard, so removing the wildcard
    // later always leaves a plan that fits
    if needed > FILTER_BANKS_PER_INSTANCE && policy == FilterOverflowPolicy::Reject {
        return Err(CanError::FilterBanksExhausted {
            instance,
            needed,
            available: FILTER_BANKS_PER_INSTANCE,
        });
    }

    let mut plan = FilterPlan::new();
    if let Some(fifo) = wildcard_fifo {
        let _ = plan.push(FilterBank::accept_all(fifo));
    } else if needed == 0 {
        let _ = plan.push(FilterBank::RejectAll);
    } else if needed > FILTER_BANKS_PER_INSTANCE {
        warn!(
            "{}: {} identifiers exceed {} filter banks, accepting all frames",
            instance, needed, FILTER_BANKS_PER_INSTANCE
        );
        let _ = plan.push(FilterBank::accept_all(Fifo::Fifo0));
    } else {
        plan = banks;
    }

    Ok(plan)
}

/// Program an instance's whole bank range from a plan
pub(crate) fn apply_plan<P: CanPeripheral + ?Sized>(
    peripheral: &P,
    instance: Instance,
    plan: &FilterPlan,
) -> core::result::Result<(), HardwareError> {
    let mut banks = plan.iter().copied();

    for bank in instance.filter_banks() {
        let filter = banks.next().unwrap_or(FilterBank::Disabled);
        peripheral.configure_filter(bank, &filter)?;
    }

    debug!("{}: programmed {} filter bank(s)", instance, plan.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(raw: u32, width: IdWidth) -> Frame {
        Frame::new(Instance::Can1, raw, width, &[]).unwrap()
    }

    fn exact(raw: u32) -> FilterRequest {
        FilterRequest {
            raw_id: raw,
            width: IdWidth::Standard,
            mode: MatchMode::Exact,
            fifo: Fifo::Fifo0,
        }
    }

    #[test]
    fn test_masked_match_range() {
        let mode = MatchMode::Masked(0x700);
        for raw in 0x100..=0x1FF {
            assert!(mode.matches(0x100, IdWidth::Standard, &frame(raw, IdWidth::Standard)));
        }
        assert!(!mode.matches(0x100, IdWidth::Standard, &frame(0x200, IdWidth::Standard)));
        assert!(!mode.matches(0x100, IdWidth::Standard, &frame(0x0FF, IdWidth::Standard)));
        // Width must agree even when the masked bits do
        assert!(!mode.matches(0x100, IdWidth::Standard, &frame(0x100, IdWidth::Extended)));
    }

    #[test]
    fn test_exact_and_wildcard_match() {
        let f = frame(0x123, IdWidth::Standard);
        assert!(MatchMode::Exact.matches(0x123, IdWidth::Standard, &f));
        assert!(!MatchMode::Exact.matches(0x124, IdWidth::Standard, &f));
        assert!(!MatchMode::Exact.matches(0x123, IdWidth::Extended, &f));
        assert!(MatchMode::Wildcard.matches(0, IdWidth::Extended, &f));
    }

    #[test]
    fn test_plan_empty_rejects_everything() {
        let plan = plan_filters(Instance::Can1, [], FilterOverflowPolicy::Reject).unwrap();
        assert_eq!(plan.as_slice(), &[FilterBank::RejectAll]);

        let bank = plan[0];
        assert!(!bank.accepts(&frame(0, IdWidth::Standard)));
        assert!(!bank.accepts(&frame(0x7FF, IdWidth::Standard)));
        assert!(!bank.accepts(&frame(0x1FFF_FFFF, IdWidth::Extended)));
    }

    #[test]
    fn test_plan_one_bank_per_identifier() {
        let plan = plan_filters(
            Instance::Can2,
            [exact(0x10), exact(0x20), exact(0x30)],
            FilterOverflowPolicy::Reject,
        )
        .unwrap();

        assert_eq!(plan.len(), 3);
        assert!(plan[1].accepts(&frame(0x20, IdWidth::Standard)));
        assert!(!plan[1].accepts(&frame(0x21, IdWidth::Standard)));
    }

    #[test]
    fn test_plan_wildcard_collapses_to_accept_all() {
        let wildcard = FilterRequest {
            mode: MatchMode::Wildcard,
            fifo: Fifo::Fifo1,
            ..exact(0)
        };
        let plan = plan_filters(
            Instance::Can1,
            [exact(0x10), wildcard],
            FilterOverflowPolicy::Reject,
        )
        .unwrap();

        assert_eq!(plan.as_slice(), &[FilterBank::accept_all(Fifo::Fifo1)]);
        assert!(plan[0].accepts(&frame(0x1ABC_DEF0, IdWidth::Extended)));
    }

    #[test]
    fn test_plan_overflow_policies() {
        let requests: std::vec::Vec<_> = (0..15).map(exact).collect();

        let err = plan_filters(Instance::Can1, requests.clone(), FilterOverflowPolicy::Reject)
            .unwrap_err();
        assert_eq!(
            err,
            CanError::FilterBanksExhausted {
                instance: Instance::Can1,
                needed: 15,
                available: 14
            }
        );

        let plan = plan_filters(Instance::Can1, requests, FilterOverflowPolicy::AcceptAll).unwrap();
        assert_eq!(plan.as_slice(), &[FilterBank::accept_all(Fifo::Fifo0)]);
    }

    #[test]
    fn test_plan_quota_counts_beside_wildcard() {
        let wildcard = FilterRequest {
            mode: MatchMode::Wildcard,
            ..exact(0x7FF)
        };
        let full: std::vec::Vec<_> = (0..14).map(exact).chain([wildcard]).collect();
        assert!(plan_filters(Instance::Can2, full, FilterOverflowPolicy::Reject).is_ok());

        let over: std::vec::Vec<_> = (0..15).map(exact).chain([wildcard]).collect();
        assert_eq!(
            plan_filters(Instance::Can2, over.clone(), FilterOverflowPolicy::Reject),
            Err(CanError::FilterBanksExhausted {
                instance: Instance::Can2,
                needed: 15,
                available: 14
            })
        );

        let plan = plan_filters(Instance::Can2, over, FilterOverflowPolicy::AcceptAll).unwrap();
        assert_eq!(plan.as_slice(), &[FilterBank::accept_all(Fifo::Fifo0)]);
    }

    #[test]
    fn test_register_layout() {
        let std_bank = FilterBank::IdMask {
            id: 0x123,
            mask: 0x7FF,
            width: IdWidth::Standard,
            fifo: Fifo::Fifo0,
        };
        assert_eq!(std_bank.registers(), Some((0x123 << 21, (0x7FF << 21) | 0x4)));
        // An extended frame must not slip through a standard bank
        assert!(!std_bank.accepts(&frame(0x123 << 18, IdWidth::Extended)));

        let ext_bank = FilterBank::IdMask {
            id: 0x18FF_50E5,
            mask: 0x1FFF_FFFF,
            width: IdWidth::Extended,
            fifo: Fifo::Fifo1,
        };
        assert!(ext_bank.accepts(&frame(0x18FF_50E5, IdWidth::Extended)));
        assert!(!ext_bank.accepts(&frame(0x18FF_50E4, IdWidth::Extended)));
        assert_eq!(FilterBank::Disabled.registers(), None);
    }
}
