//! Send scheduler.
//!
//! Called per meta-segment to pick the subflow that will carry it.
//! Selection goes through a registry table so alternative schedulers can
//! be slotted in by configuration; one min-RTT scheduler is registered.

use braid_core::segment::Segment;
use once_cell::sync::Lazy;
use tracing::trace;

use crate::subflow::Subflow;

/// A subflow is eligible for a segment when it can carry fresh data and
/// does not already carry this byte range.
#[must_use]
pub fn is_eligible(sf: &Subflow, noneligible: u32, seg: &Segment) -> bool {
    if !sf.state.can_send() || sf.pf || !sf.attached {
        return false;
    }
    if noneligible & sf.path_mask() != 0 {
        return false;
    }
    if seg.carried_on(sf.path_index) {
        return false;
    }
    let info = sf.info();
    if info.loss_recovery {
        return false;
    }
    info.in_flight < info.snd_cwnd
}

/// A scheduler picks a path index for one segment, or none.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, subflows: &[Subflow], noneligible: u32, seg: &Segment) -> Option<u8>;
}

/// Minimum smoothed-RTT scheduler with backup demotion: backup subflows
/// are considered only when no regular subflow is eligible.
pub struct MinRttScheduler;

impl MinRttScheduler {
    fn best_of<'a>(
        candidates: impl Iterator<Item = &'a Subflow>,
        noneligible: u32,
        seg: &Segment,
    ) -> Option<u8> {
        candidates
            .filter(|sf| is_eligible(sf, noneligible, seg))
            .min_by_key(|sf| sf.info().srtt)
            .map(|sf| sf.path_index)
    }
}

impl Scheduler for MinRttScheduler {
    fn name(&self) -> &'static str {
        "minrtt"
    }

    fn select(&self, subflows: &[Subflow], noneligible: u32, seg: &Segment) -> Option<u8> {
        // Shortcut: a lone subflow is taken as-is when eligible.
        if let [only] = subflows {
            return is_eligible(only, noneligible, seg).then_some(only.path_index);
        }

        let pick = Self::best_of(
            subflows.iter().filter(|sf| !sf.backup),
            noneligible,
            seg,
        )
        .or_else(|| {
            Self::best_of(subflows.iter().filter(|sf| sf.backup), noneligible, seg)
        });

        if let Some(pi) = pick {
            trace!(path_index = pi, "scheduler picked subflow");
        }
        pick
    }
}

static SCHEDULERS: Lazy<Vec<&'static dyn Scheduler>> = Lazy::new(|| vec![&MinRttScheduler]);

/// Resolve the scheduler selected by configuration. Out-of-range
/// indices fall back to the first entry.
#[must_use]
pub fn scheduler_by_index(index: usize) -> &'static dyn Scheduler {
    SCHEDULERS
        .get(index)
        .copied()
        .unwrap_or_else(|| SCHEDULERS[0])
}
