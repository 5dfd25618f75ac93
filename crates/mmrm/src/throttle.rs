//! Demotion of a throttle-eligible client to free current headroom.

use std::time::Duration;

use serde::Serialize;

use crate::admission::SystemBudget;
use crate::backend::{deliver, ClockBackend, RateChange};
use crate::client::ClientTable;
use crate::engine::EngineState;
use crate::level::VoltageLevel;

/// A client forcibly demoted to the lowest level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThrottleRecord {
    /// Client table index of the victim.
    pub victim: usize,
    /// Current released by the demotion, measured at the rail level of the time.
    pub current_freed_ma: u64,
    pub level_before: VoltageLevel,
    pub rate_before: u64,
}

/// Throttle candidate chosen by [`select_victim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Victim {
    pub(crate) index: usize,
    pub(crate) now_ma: u64,
    pub(crate) min_ma: u64,
}

impl Victim {
    pub(crate) fn freed_ma(&self) -> u64 {
        self.now_ma - self.min_ma
    }
}

/// First eligible client, in configured order, whose demotion frees more than `needed_ma`.
///
/// Only one candidate is ever tried per request; a stricter policy that keeps
/// searching after a refusal would replace this function.
pub(crate) fn select_victim(
    table: &ClientTable,
    budget: &SystemBudget,
    eligible: &[usize],
    requester: usize,
    needed_ma: u64,
) -> Option<Victim> {
    let column = budget.aggregate_level;
    eligible
        .iter()
        .copied()
        .filter(|index| *index != requester)
        .find_map(|index| {
            let entry = table.entry(index);
            if !entry.is_active() || entry.cost.rate_at(VoltageLevel::LOWEST) == 0 {
                return None;
            }
            let blocks = u64::from(entry.num_hw_blocks);
            let now_ma = entry.cost.current_ma(entry.active_level, column) * blocks;
            let min_ma = entry.cost.current_ma(VoltageLevel::LOWEST, column) * blocks;
            (now_ma.saturating_sub(min_ma) > needed_ma).then_some(Victim {
                index,
                now_ma,
                min_ma,
            })
        })
}

/// Tries to free `needed_ma` by demoting one eligible client.
///
/// Returns `false` when no candidate exists or the candidate refuses.
pub(crate) fn throttle<B: ClockBackend + ?Sized>(
    state: &mut EngineState,
    backend: &B,
    eligible: &[usize],
    requester: usize,
    needed_ma: u64,
    callback_timeout: Duration,
) -> bool {
    let Some(victim) = select_victim(&state.table, &state.budget, eligible, requester, needed_ma)
    else {
        tracing::warn!(
            requester = %state.table.entry(requester).id,
            needed_ma,
            "no throttle candidate frees enough current"
        );
        return false;
    };

    let entry = state.table.entry(victim.index);
    let lowest_rate = entry.cost.rate_at(VoltageLevel::LOWEST);
    let change = RateChange {
        client: entry.id,
        old_rate: entry.cost.rate_at(entry.active_level),
        new_rate: lowest_rate,
        user_data: entry.user_data(),
    };

    if let Err(err) = deliver(entry.notifier(), &change, callback_timeout) {
        tracing::error!(
            victim = %entry.id,
            requester = %state.table.entry(requester).id,
            needed_ma,
            error = ?err,
            "throttle victim refused rate change"
        );
        dump_contributions(&state.table, &state.budget);
        return false;
    }

    if !entry.reserve_only {
        if let Err(err) = backend.set_rate(entry.id, lowest_rate) {
            tracing::warn!(victim = %entry.id, rate = lowest_rate, error = ?err, "failed to lower throttled clock");
        }
    }

    let record = ThrottleRecord {
        victim: victim.index,
        current_freed_ma: victim.freed_ma(),
        level_before: entry.active_level,
        rate_before: entry.active_rate,
    };

    let entry = state.table.entry_mut(victim.index);
    entry.active_level = VoltageLevel::LOWEST;
    entry.active_rate = lowest_rate;
    state.budget.aggregate_ma = state
        .table
        .aggregate_at(state.budget.aggregate_level, None);
    state.throttled.push(record);

    tracing::info!(
        victim = %state.table.entry(victim.index).id,
        requester = %state.table.entry(requester).id,
        freed_ma = record.current_freed_ma,
        level_before = %record.level_before,
        aggregate_ma = state.budget.aggregate_ma,
        "throttled client to lowest level"
    );

    true
}

/// Logs every active client's share of the aggregate for post-mortem analysis.
pub(crate) fn dump_contributions(table: &ClientTable, budget: &SystemBudget) {
    tracing::error!(
        threshold_ma = budget.threshold_ma,
        aggregate_ma = budget.aggregate_ma,
        aggregate_level = %budget.aggregate_level,
        "current budget state"
    );
    for entry in table.entries().iter().filter(|entry| entry.is_active()) {
        tracing::error!(
            client = %entry.id,
            name = %entry.name,
            rate = entry.active_rate,
            level = %entry.active_level,
            hw_blocks = entry.num_hw_blocks,
            reserve_only = entry.reserve_only,
            contribution_ma = entry.contribution_ma(budget.aggregate_level),
            "active client contribution"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientDescriptor, ClientEntry, ClockSourceId};
    use crate::config::ClientConfig;
    use crate::cost_model::CostModel;
    use crate::testing::{flat_scaling, MHZ};
    use similar_asserts::assert_eq;

    const FREQ: [u64; 5] = [100 * MHZ, 200 * MHZ, 300 * MHZ, 400 * MHZ, 500 * MHZ];

    fn table(levels: &[(u32, f64, VoltageLevel)]) -> (ClientTable, SystemBudget) {
        let entries = levels
            .iter()
            .map(|(local, dynamic, _)| {
                let config = ClientConfig {
                    id: ClockSourceId::new(0, *local),
                    name: String::new(),
                    nominal_dynamic_mw: *dynamic,
                    nominal_leakage_mw: 0.0,
                    hw_blocks: vec![1],
                };
                ClientEntry::new(
                    &config,
                    CostModel::from_frequency_table(FREQ, *dynamic, 0.0, &flat_scaling()),
                )
            })
            .collect();
        let mut table = ClientTable::new(entries);
        for (index, (local, _, level)) in levels.iter().enumerate() {
            table
                .register(ClientDescriptor::new(ClockSourceId::new(0, *local)))
                .unwrap();
            let entry = table.entry_mut(index);
            entry.active_rate = FREQ[level.index()];
            entry.active_level = *level;
            entry.num_hw_blocks = 1;
        }
        let level = table.highest_active_level().unwrap_or(VoltageLevel::LOWEST);
        let budget = SystemBudget {
            threshold_ma: 1000,
            aggregate_ma: table.aggregate_at(level, None),
            aggregate_level: level,
        };
        (table, budget)
    }

    #[test]
    fn first_sufficient_candidate_wins() {
        let (table, budget) = table(&[
            (1, 400.0, VoltageLevel::Nominal),
            (2, 800.0, VoltageLevel::Nominal),
            (3, 200.0, VoltageLevel::Nominal),
        ]);
        // Client 1 frees 300 mA, client 2 frees 600 mA.
        let victim = select_victim(&table, &budget, &[0, 1], 2, 250).unwrap();
        assert_eq!(victim.index, 0);
        assert_eq!(victim.freed_ma(), 300);

        let victim = select_victim(&table, &budget, &[0, 1], 2, 300).unwrap();
        assert_eq!(victim.index, 1);
    }

    #[test]
    fn requester_and_idle_clients_are_skipped() {
        let (mut table, budget) = table(&[
            (1, 800.0, VoltageLevel::Nominal),
            (2, 800.0, VoltageLevel::Nominal),
        ]);
        assert_eq!(select_victim(&table, &budget, &[0], 0, 10), None);

        table.entry_mut(1).active_rate = 0;
        assert_eq!(select_victim(&table, &budget, &[1], 0, 10), None);
    }

    #[test]
    fn candidates_at_lowest_level_free_nothing() {
        let (table, budget) = table(&[
            (1, 800.0, VoltageLevel::LowSvs),
            (2, 400.0, VoltageLevel::Turbo),
        ]);
        assert_eq!(select_victim(&table, &budget, &[0], 1, 1), None);
    }
}
