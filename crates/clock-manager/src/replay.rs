//! Trace replay against a [`ResourceEngine`] over simulated clocks.

use std::collections::HashMap;

use anyhow::Result;
use error_stack::report;
use mmrm::{
    ClientDescriptor, ClientHandle, ClockBackend, ClockSourceId, EngineSnapshot, NotifyError,
    PlatformConfig, Priority, RateChange, RegistrationPolicy, ResourceEngine,
};
use serde::{Deserialize, Serialize};

use crate::simulator::{ClockSpec, SimulatedClock, SimulatedClockBackend};

/// Simulated hardware plus the ordered steps to replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    /// Clock used for sources not listed in `clocks`.
    #[serde(default)]
    pub default_clock: Option<SimulatedClock>,
    #[serde(default)]
    pub clocks: Vec<ClockSpec>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Step {
    Register(RegisterStep),
    Request(RequestStep),
    Deregister(ClockSourceId),
    Query(ClockSourceId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterStep {
    #[serde(flatten)]
    pub id: ClockSourceId,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub policy: RegistrationPolicy,
    #[serde(default)]
    pub user_data: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStep {
    #[serde(flatten)]
    pub id: ClockSourceId,
    pub rate_hz: u64,
    #[serde(default = "default_hw_blocks")]
    pub hw_blocks: u32,
    #[serde(default)]
    pub reserve_only: bool,
}

fn default_hw_blocks() -> u32 {
    1
}

impl Step {
    fn client(&self) -> ClockSourceId {
        match self {
            Self::Register(step) => step.id,
            Self::Request(step) => step.id,
            Self::Deregister(id) | Self::Query(id) => *id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Request(_) => "request",
            Self::Deregister(_) => "deregister",
            Self::Query(_) => "query",
        }
    }
}

/// Result of one replayed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub index: usize,
    pub step: &'static str,
    pub client: ClockSourceId,
    /// `ok`, a queried rate, or the error kind.
    pub outcome: String,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub outcomes: Vec<StepOutcome>,
    pub snapshot: EngineSnapshot,
}

impl ReplayReport {
    pub fn rejected(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.accepted).count()
    }
}

fn notifier(client: ClockSourceId, refuse: bool) -> impl mmrm::NotificationSink {
    move |change: &RateChange| -> error_stack::Result<(), NotifyError> {
        if refuse {
            return Err(report!(NotifyError::new("simulated client refused"))
                .attach_printable(format!("client: {client}")));
        }
        tracing::info!(
            client = %change.client,
            old_rate = change.old_rate,
            new_rate = change.new_rate,
            user_data = change.user_data,
            "client accepted forced rate change"
        );
        Ok(())
    }
}

/// Builds an engine for `platform` over the trace's clocks and replays every step.
///
/// Rejected steps are recorded and the replay continues.
pub fn run(platform: &PlatformConfig, trace: &Trace) -> Result<ReplayReport> {
    let backend = SimulatedClockBackend::new(&trace.clocks, trace.default_clock.clone());
    let engine = ResourceEngine::new(backend, platform)
        .map_err(|report| anyhow::anyhow!("{report:?}"))?;
    Ok(replay(&engine, &trace.steps))
}

fn replay(engine: &ResourceEngine<SimulatedClockBackend>, steps: &[Step]) -> ReplayReport {
    let mut handles: HashMap<ClockSourceId, Vec<ClientHandle>> = HashMap::new();
    let mut outcomes = Vec::with_capacity(steps.len());

    for (index, step) in steps.iter().enumerate() {
        let client = step.client();
        let result = match step {
            Step::Register(register) => {
                let refuse = engine.backend().clock(register.id).refuse_notifications;
                let desc = ClientDescriptor::new(register.id)
                    .with_priority(register.priority)
                    .with_policy(register.policy)
                    .with_user_data(register.user_data)
                    .with_notifier(notifier(register.id, refuse));
                engine.register(desc).map(|handle| {
                    handles.entry(register.id).or_default().push(handle);
                    "ok".to_string()
                })
            }
            Step::Request(request) => match handle_for(&handles, request.id) {
                Some(handle) => engine
                    .request_rate(handle, request.rate_hz, request.hw_blocks, request.reserve_only)
                    .map(|()| "ok".to_string()),
                None => Err(report!(mmrm::MmrmError::InvalidHandle)),
            },
            Step::Deregister(id) => match handles.get_mut(id).and_then(Vec::pop) {
                Some(handle) => engine.deregister(handle).map(|()| "ok".to_string()),
                None => Err(report!(mmrm::MmrmError::InvalidHandle)),
            },
            Step::Query(id) => match handle_for(&handles, *id) {
                Some(handle) => engine
                    .query_rate(handle)
                    .map(|range| format!("{} Hz", range.current_hz)),
                None => Err(report!(mmrm::MmrmError::InvalidHandle)),
            },
        };

        let outcome = match result {
            Ok(outcome) => {
                tracing::info!(step = index, kind = step.kind(), %client, %outcome, "step applied");
                StepOutcome {
                    index,
                    step: step.kind(),
                    client,
                    outcome,
                    accepted: true,
                }
            }
            Err(err) => {
                tracing::warn!(step = index, kind = step.kind(), %client, error = ?err, "step rejected");
                StepOutcome {
                    index,
                    step: step.kind(),
                    client,
                    outcome: err.current_context().to_string(),
                    accepted: false,
                }
            }
        };
        outcomes.push(outcome);
    }

    let snapshot = engine.snapshot();
    for client in snapshot.clients.iter().filter(|c| c.registered) {
        tracing::debug!(
            client = %client.id,
            programmed = ?engine.backend().programmed_rate(client.id),
            recorded = client.rate_hz,
            "final clock state"
        );
    }

    ReplayReport { outcomes, snapshot }
}

fn handle_for(
    handles: &HashMap<ClockSourceId, Vec<ClientHandle>>,
    id: ClockSourceId,
) -> Option<ClientHandle> {
    handles.get(&id).and_then(|list| list.last()).copied()
}

/// Frequency tables the engine would derive for every client.
pub fn describe_cost_models<B: ClockBackend>(
    platform: &PlatformConfig,
    backend: &B,
) -> Vec<(ClockSourceId, String, mmrm::CostModel)> {
    platform
        .clients
        .iter()
        .map(|client| {
            let model = mmrm::CostModel::build(
                backend,
                client,
                &platform.scaling,
                platform.rate_step_hz,
            );
            (client.id, client.name.clone(), model)
        })
        .collect()
}
