//! Restoring throttled clients once the budget has room again.

use std::time::Duration;

use crate::backend::{deliver, ClockBackend, RateChange};
use crate::engine::EngineState;
use crate::level::VoltageLevel;
use crate::throttle::ThrottleRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Restored,
    /// Victim left the throttled state on its own.
    Stale,
    /// Not enough headroom yet.
    Deferred,
    Refused,
}

/// Walks the throttle records oldest first and restores every victim that fits.
///
/// Returns the number of clients restored.
pub(crate) fn reinstate<B: ClockBackend + ?Sized>(
    state: &mut EngineState,
    backend: &B,
    callback_timeout: Duration,
) -> usize {
    let records = std::mem::take(&mut state.throttled);
    let mut restored = 0;
    for record in records {
        match try_restore(state, backend, &record, callback_timeout) {
            Outcome::Restored => restored += 1,
            Outcome::Stale => {}
            Outcome::Deferred | Outcome::Refused => state.throttled.push(record),
        }
    }
    restored
}

/// Restores the victim of the most recent throttle and leaves older records alone.
///
/// Returns `false` when the victim stays throttled; its record is kept.
pub(crate) fn undo_last_throttle<B: ClockBackend + ?Sized>(
    state: &mut EngineState,
    backend: &B,
    callback_timeout: Duration,
) -> bool {
    let Some(record) = state.throttled.pop() else {
        return false;
    };
    match try_restore(state, backend, &record, callback_timeout) {
        Outcome::Restored => true,
        Outcome::Stale => false,
        Outcome::Deferred | Outcome::Refused => {
            state.throttled.push(record);
            false
        }
    }
}

/// Puts one victim back at `record.level_before` if the budget allows it.
///
/// The prospective aggregate is a full recompute at
/// `max(aggregate_level, level_before)`, not `aggregate_ma + current_freed_ma`.
/// The freed amount was priced at the rail level of the throttle, and every
/// other client's contribution may have moved since then. Restoring can also
/// raise the rail, which reprices everyone.
fn try_restore<B: ClockBackend + ?Sized>(
    state: &mut EngineState,
    backend: &B,
    record: &ThrottleRecord,
    callback_timeout: Duration,
) -> Outcome {
    let entry = state.table.entry(record.victim);
    if !entry.is_active() || entry.active_level != VoltageLevel::LOWEST {
        return Outcome::Stale;
    }

    let column = state.budget.aggregate_level.max(record.level_before);
    let restored_ma =
        entry.cost.current_ma(record.level_before, column) * u64::from(entry.num_hw_blocks);
    let prospective_ma = state.table.aggregate_at(column, Some(record.victim)) + restored_ma;
    if prospective_ma > state.budget.threshold_ma {
        tracing::debug!(
            victim = %entry.id,
            prospective_ma,
            threshold_ma = state.budget.threshold_ma,
            "throttled client must wait for headroom"
        );
        return Outcome::Deferred;
    }

    let change = RateChange {
        client: entry.id,
        old_rate: entry.active_rate,
        new_rate: record.rate_before,
        user_data: entry.user_data(),
    };
    if let Err(err) = deliver(entry.notifier(), &change, callback_timeout) {
        tracing::warn!(victim = %entry.id, error = ?err, "client refused reinstatement");
        return Outcome::Refused;
    }

    if !entry.reserve_only {
        if let Err(err) = backend.set_rate(entry.id, record.rate_before) {
            tracing::warn!(
                victim = %entry.id,
                rate = record.rate_before,
                error = ?err,
                "failed to restore throttled clock"
            );
        }
    }

    let entry = state.table.entry_mut(record.victim);
    entry.active_level = record.level_before;
    entry.active_rate = record.rate_before;
    state.budget.aggregate_ma = prospective_ma;
    state.budget.aggregate_level = column;

    tracing::info!(
        client = %state.table.entry(record.victim).id,
        rate = record.rate_before,
        level = %record.level_before,
        aggregate_ma = prospective_ma,
        "reinstated throttled client"
    );

    Outcome::Restored
}
