//! Level resolution and aggregate-current evaluation for rate requests.

use error_stack::{report, Result};
use serde::Serialize;

use crate::client::{ClientEntry, ClientTable};
use crate::level::VoltageLevel;
use crate::MmrmError;

/// Peak current budget of the shared rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemBudget {
    /// Immutable after construction.
    pub threshold_ma: u64,
    /// Sum of active contributions evaluated at `aggregate_level`.
    pub aggregate_ma: u64,
    pub aggregate_level: VoltageLevel,
}

impl SystemBudget {
    pub fn new(threshold_ma: u64) -> Self {
        Self {
            threshold_ma,
            aggregate_ma: 0,
            aggregate_level: VoltageLevel::LOWEST,
        }
    }
}

/// Aggregate current the system would see if a request were granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Proposal {
    /// Level implied by the requested rate.
    pub(crate) level: VoltageLevel,
    /// Rail level after accounting for the other active clients.
    pub(crate) adjusted_level: VoltageLevel,
    pub(crate) new_ma: u64,
    pub(crate) old_ma: u64,
    pub(crate) prospective_ma: i64,
}

impl Proposal {
    /// Aggregate current once committed.
    pub(crate) fn aggregate_ma(&self) -> u64 {
        self.prospective_ma.max(0) as u64
    }

    /// Current that has to be freed before the proposal fits under `threshold_ma`.
    pub(crate) fn shortfall_ma(&self, threshold_ma: u64) -> Option<u64> {
        let threshold = threshold_ma as i64;
        (self.prospective_ma >= threshold).then(|| (self.prospective_ma - threshold + 1) as u64)
    }
}

/// Smallest level whose ceiling covers `rate`; rate 0 releases to the lowest level.
pub(crate) fn resolve_level(entry: &ClientEntry, rate: u64) -> Result<VoltageLevel, MmrmError> {
    if rate == 0 {
        return Ok(VoltageLevel::LOWEST);
    }
    entry.cost.level_for_rate(rate).ok_or_else(|| {
        report!(MmrmError::RateOutOfRange {
            rate_hz: rate,
            max_hz: entry.cost.max_rate(),
        })
        .attach_printable(format!("client: {}", entry.id))
    })
}

/// The rail cannot drop below any other active client's level.
pub(crate) fn adjust_level(
    table: &ClientTable,
    budget: &SystemBudget,
    requester: usize,
    level: VoltageLevel,
) -> VoltageLevel {
    let ceiling = budget.aggregate_level;
    if level >= ceiling {
        return level;
    }

    let mut adjusted = level;
    for other in table.others(requester) {
        if other.active_level == ceiling {
            return ceiling;
        }
        if other.active_level > adjusted && other.active_level < ceiling {
            adjusted = other.active_level;
        }
    }
    adjusted
}

/// Evaluates `rate` at `num_hw_blocks` for the client at `requester`.
pub(crate) fn propose(
    table: &ClientTable,
    budget: &SystemBudget,
    requester: usize,
    rate: u64,
    num_hw_blocks: u32,
) -> Result<Proposal, MmrmError> {
    let entry = table.entry(requester);
    let level = resolve_level(entry, rate)?;
    let adjusted_level = adjust_level(table, budget, requester, level);

    let new_ma = if rate == 0 {
        0
    } else {
        entry.cost.current_ma(level, adjusted_level) * u64::from(num_hw_blocks)
    };
    let old_ma = entry.contribution_ma(budget.aggregate_level);

    // Moving the rail changes every other client's contribution.
    let prospective_ma = if adjusted_level != budget.aggregate_level {
        table.aggregate_at(adjusted_level, Some(requester)) as i64 + new_ma as i64
    } else {
        budget.aggregate_ma as i64 + new_ma as i64 - old_ma as i64
    };

    tracing::debug!(
        client = %entry.id,
        rate,
        level = %level,
        adjusted_level = %adjusted_level,
        new_ma,
        old_ma,
        prospective_ma,
        "evaluated rate request"
    );

    Ok(Proposal {
        level,
        adjusted_level,
        new_ma,
        old_ma,
        prospective_ma,
    })
}
