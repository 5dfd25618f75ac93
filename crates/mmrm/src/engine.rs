//! The resource engine: one lock around the client table and the budget.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use error_stack::{report, Result, ResultExt};
use serde::Serialize;

use crate::admission::{self, Proposal, SystemBudget};
use crate::backend::ClockBackend;
use crate::client::{
    ClientDescriptor, ClientEntry, ClientHandle, ClientTable, ClockSourceId, Priority,
};
use crate::config::PlatformConfig;
use crate::cost_model::CostModel;
use crate::level::VoltageLevel;
use crate::reinstate::{reinstate, undo_last_throttle};
use crate::throttle::{self, ThrottleRecord};
use crate::MmrmError;

/// State guarded by the engine lock.
#[derive(Debug)]
pub(crate) struct EngineState {
    pub(crate) table: ClientTable,
    pub(crate) budget: SystemBudget,
    /// Oldest first.
    pub(crate) throttled: Vec<ThrottleRecord>,
}

impl EngineState {
    fn commit(
        &mut self,
        index: usize,
        rate: u64,
        num_hw_blocks: u32,
        reserve_only: bool,
        proposal: &Proposal,
    ) {
        let entry = self.table.entry_mut(index);
        entry.active_rate = rate;
        entry.active_level = proposal.level;
        entry.num_hw_blocks = num_hw_blocks;
        entry.reserve_only = reserve_only;

        self.budget.aggregate_ma = proposal.aggregate_ma();
        self.budget.aggregate_level = proposal.adjusted_level;
    }

    /// An accepted request supersedes the rate the client was throttled from.
    fn drop_throttle_record(&mut self, index: usize) {
        let before = self.throttled.len();
        self.throttled.retain(|record| record.victim != index);
        if self.throttled.len() != before {
            tracing::debug!(
                client = %self.table.entry(index).id,
                "dropped throttle record on accepted request"
            );
        }
    }
}

/// Rate currently granted to a client. No range tracking is done, so
/// `min_hz` and `max_hz` always equal `current_hz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateRange {
    pub min_hz: u64,
    pub current_hz: u64,
    pub max_hz: u64,
}

/// Point-in-time view of one client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub id: ClockSourceId,
    pub name: String,
    pub registered: bool,
    pub priority: Priority,
    pub rate_hz: u64,
    pub level: VoltageLevel,
    pub hw_blocks: u32,
    pub reserve_only: bool,
    /// Share of the aggregate at the current rail level.
    pub contribution_ma: u64,
    pub throttled: bool,
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub threshold_ma: u64,
    pub aggregate_ma: u64,
    pub aggregate_level: VoltageLevel,
    pub clients: Vec<ClientSnapshot>,
    pub throttled: Vec<ThrottleRecord>,
}

/// Admission and throttling engine for clocks sharing one current budget.
///
/// Every operation runs under a single exclusive lock, including notification
/// callbacks and backend calls. Callbacks must not re-enter the engine.
pub struct ResourceEngine<B: ClockBackend> {
    backend: B,
    state: Mutex<EngineState>,
    /// Client table indices, in the configured throttle order.
    eligible: Vec<usize>,
    callback_timeout: Duration,
}

impl<B: ClockBackend> ResourceEngine<B> {
    /// Validates `platform` and derives every client's cost model from `backend`.
    pub fn new(backend: B, platform: &PlatformConfig) -> Result<Self, MmrmError> {
        platform.validate()?;

        let entries = platform
            .clients
            .iter()
            .map(|client| {
                let cost =
                    CostModel::build(&backend, client, &platform.scaling, platform.rate_step_hz);
                ClientEntry::new(client, cost)
            })
            .collect();
        let table = ClientTable::new(entries);
        let eligible = platform
            .throttle_eligible
            .iter()
            .filter_map(|id| table.index_of(*id))
            .collect::<Vec<_>>();

        tracing::info!(
            clients = platform.clients.len(),
            throttle_eligible = eligible.len(),
            threshold_ma = platform.threshold_ma,
            "initialized clock resource engine"
        );

        Ok(Self {
            backend,
            state: Mutex::new(EngineState {
                table,
                budget: SystemBudget::new(platform.threshold_ma),
                throttled: Vec::new(),
            }),
            eligible,
            callback_timeout: platform.callback_timeout(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn threshold_ma(&self) -> u64 {
        self.lock().budget.threshold_ma
    }

    /// Registers a client for one of the described clock sources.
    pub fn register(&self, desc: ClientDescriptor) -> Result<ClientHandle, MmrmError> {
        let mut state = self.lock();
        let id = desc.id;
        let priority = desc.priority;
        let policy = desc.policy;
        let handle = state.table.register(desc)?;
        tracing::info!(client = %id, %handle, %priority, %policy, "registered client");
        Ok(handle)
    }

    /// Drops one registration; the last one releases the client's current.
    ///
    /// This is the only operation that may leave the aggregate above the
    /// threshold. Releasing a client can lower the rail level, and repricing
    /// the remaining clients at the lower level can raise their current. That
    /// case is logged at warn and the deregistration still succeeds.
    pub fn deregister(&self, handle: ClientHandle) -> Result<(), MmrmError> {
        let mut state = self.lock();
        let index = state.table.resolve(handle)?;
        let id = state.table.entry(index).id;
        let remaining = state.table.release(handle)?;
        if remaining > 0 {
            tracing::debug!(client = %id, remaining, "released shared registration");
            return Ok(());
        }

        state.throttled.retain(|record| record.victim != index);
        let level = state
            .table
            .highest_active_level()
            .unwrap_or(VoltageLevel::LOWEST);
        state.budget.aggregate_level = level;
        state.budget.aggregate_ma = state.table.aggregate_at(level, None);

        tracing::info!(
            client = %id,
            aggregate_ma = state.budget.aggregate_ma,
            aggregate_level = %level,
            "deregistered client"
        );
        if state.budget.aggregate_ma > state.budget.threshold_ma {
            // Lowering the rail raises everyone's current when voltage factors differ.
            tracing::warn!(
                aggregate_ma = state.budget.aggregate_ma,
                threshold_ma = state.budget.threshold_ma,
                "aggregate above threshold after deregistration"
            );
        }

        reinstate(&mut state, &self.backend, self.callback_timeout);
        Ok(())
    }

    /// Requests `rate` Hz on `num_hw_blocks` hardware instances.
    ///
    /// With `reserve_only` the decision is recorded but the clock is not programmed.
    pub fn request_rate(
        &self,
        handle: ClientHandle,
        rate: u64,
        num_hw_blocks: u32,
        reserve_only: bool,
    ) -> Result<(), MmrmError> {
        let mut state = self.lock();
        let index = state.table.resolve(handle)?;
        let entry = state.table.entry(index);
        let id = entry.id;

        if rate != 0 && !entry.supports_hw_blocks(num_hw_blocks) {
            return Err(report!(MmrmError::InvalidHwBlockCount {
                count: num_hw_blocks
            })
            .attach_printable(format!("client: {id}"))
            .attach_printable(format!("supported: {:?}", entry.hw_blocks)));
        }

        if rate == entry.active_rate && num_hw_blocks == entry.num_hw_blocks {
            if reserve_only == entry.reserve_only {
                tracing::debug!(client = %id, rate, "rate unchanged");
                state.drop_throttle_record(index);
                return Ok(());
            }
            if entry.reserve_only {
                // Admission was already granted by the reservation.
                state.drop_throttle_record(index);
                state.table.entry_mut(index).reserve_only = false;
                tracing::debug!(client = %id, rate, "applying reserved rate");
                return self.apply_rate(id, rate);
            }
        }

        let proposal = self.admit(&mut state, index, rate, num_hw_blocks)?;
        state.drop_throttle_record(index);
        state.commit(index, rate, num_hw_blocks, reserve_only, &proposal);

        tracing::debug!(
            client = %id,
            rate,
            level = %proposal.level,
            aggregate_ma = state.budget.aggregate_ma,
            aggregate_level = %state.budget.aggregate_level,
            reserve_only,
            "admitted rate request"
        );

        // Bookkeeping stays committed even if the clock cannot be programmed.
        let applied = if reserve_only {
            Ok(())
        } else {
            self.apply_rate(id, rate)
        };
        reinstate(&mut state, &self.backend, self.callback_timeout);
        applied
    }

    /// Rate currently recorded for the client.
    pub fn query_rate(&self, handle: ClientHandle) -> Result<RateRange, MmrmError> {
        let state = self.lock();
        let index = state.table.resolve(handle)?;
        let rate = state.table.entry(index).active_rate;
        Ok(RateRange {
            min_hz: rate,
            current_hz: rate,
            max_hz: rate,
        })
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.lock();
        let column = state.budget.aggregate_level;
        let clients = state
            .table
            .entries()
            .iter()
            .enumerate()
            .map(|(index, entry)| ClientSnapshot {
                id: entry.id,
                name: entry.name.clone(),
                registered: entry.is_registered(),
                priority: entry.priority(),
                rate_hz: entry.active_rate,
                level: entry.active_level,
                hw_blocks: entry.num_hw_blocks,
                reserve_only: entry.reserve_only,
                contribution_ma: entry.contribution_ma(column),
                throttled: state.throttled.iter().any(|r| r.victim == index),
            })
            .collect();

        EngineSnapshot {
            threshold_ma: state.budget.threshold_ma,
            aggregate_ma: state.budget.aggregate_ma,
            aggregate_level: column,
            clients,
            throttled: state.throttled.clone(),
        }
    }

    /// Evaluates a request, throttling on behalf of high priority clients.
    fn admit(
        &self,
        state: &mut EngineState,
        index: usize,
        rate: u64,
        num_hw_blocks: u32,
    ) -> Result<Proposal, MmrmError> {
        let threshold_ma = state.budget.threshold_ma;
        let proposal = admission::propose(&state.table, &state.budget, index, rate, num_hw_blocks)?;
        let Some(needed_ma) = proposal.shortfall_ma(threshold_ma) else {
            return Ok(proposal);
        };

        let entry = state.table.entry(index);
        if entry.priority() != Priority::High {
            tracing::debug!(
                client = %entry.id,
                prospective_ma = proposal.prospective_ma,
                threshold_ma,
                "rejected request over budget"
            );
            return Err(budget_exceeded(&proposal, threshold_ma, entry.id));
        }

        let id = entry.id;
        let throttled = throttle::throttle(
            state,
            &self.backend,
            &self.eligible,
            index,
            needed_ma,
            self.callback_timeout,
        );
        if !throttled {
            return Err(budget_exceeded(&proposal, threshold_ma, id)
                .attach_printable(format!("needed: {needed_ma} mA")));
        }

        let err = match admission::propose(&state.table, &state.budget, index, rate, num_hw_blocks)
        {
            Ok(retry) if retry.shortfall_ma(threshold_ma).is_none() => return Ok(retry),
            Ok(retry) => budget_exceeded(&retry, threshold_ma, id),
            Err(err) => err,
        };
        // The demotion bought nothing for this request; restore only that victim.
        undo_last_throttle(state, &self.backend, self.callback_timeout);
        Err(err)
    }

    fn apply_rate(&self, id: ClockSourceId, rate: u64) -> Result<(), MmrmError> {
        self.backend
            .set_rate(id, rate)
            .change_context(MmrmError::BackendError)
            .attach_printable_lazy(|| format!("client: {id}"))
            .attach_printable_lazy(|| format!("rate: {rate} Hz"))
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("engine lock poisoned, recovering state");
            poisoned.into_inner()
        })
    }
}

fn budget_exceeded(
    proposal: &Proposal,
    threshold_ma: u64,
    id: ClockSourceId,
) -> error_stack::Report<MmrmError> {
    report!(MmrmError::BudgetExceeded {
        prospective_ma: proposal.prospective_ma,
        threshold_ma,
    })
    .attach_printable(format!("client: {id}"))
    .attach_printable(format!("level: {}", proposal.adjusted_level))
}
