#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use error_stack::{report, Result};
use mmrm::{
    ClientConfig, ClientDescriptor, ClientHandle, ClockBackend, ClockError, ClockSourceId,
    EngineSnapshot, NotifyError, PlatformConfig, RateChange, ResourceEngine, ScalingFactors,
};

pub const MHZ: u64 = 1_000_000;

/// Rate ceilings of the simulated ladder, one per level.
pub const LADDER: [u64; 5] = [100 * MHZ, 200 * MHZ, 300 * MHZ, 400 * MHZ, 500 * MHZ];

const CORNERS: [u32; 5] = [64, 128, 192, 256, 384];

/// Clock that records every programmed rate.
#[derive(Debug, Clone, Default)]
pub struct RecordingClock {
    calls: Arc<Mutex<Vec<(ClockSourceId, u64)>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingClock {
    pub fn calls(&self) -> Vec<(ClockSourceId, u64)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, clk: ClockSourceId) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| *id == clk)
            .map(|(_, rate)| rate)
            .collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ClockBackend for RecordingClock {
    fn rate_bounds(&self, _clk: ClockSourceId) -> Result<(u64, u64), ClockError> {
        Ok((LADDER[0], LADDER[4]))
    }

    fn round_rate(&self, _clk: ClockSourceId, target: u64) -> Result<u64, ClockError> {
        Ok(target.clamp(LADDER[0], LADDER[4]))
    }

    fn voltage_for_rate(&self, _clk: ClockSourceId, rate: u64) -> Result<u32, ClockError> {
        LADDER
            .iter()
            .position(|ceiling| rate <= *ceiling)
            .map(|i| CORNERS[i])
            .ok_or_else(|| report!(ClockError::new("rate above ladder")))
    }

    fn set_rate(&self, clk: ClockSourceId, rate: u64) -> Result<(), ClockError> {
        self.calls.lock().unwrap().push((clk, rate));
        if self.failing.load(Ordering::SeqCst) {
            return Err(report!(ClockError::new("pll did not lock")));
        }
        Ok(())
    }
}

/// Client `local_id` in domain 0.
pub fn clk(local_id: u32) -> ClockSourceId {
    ClockSourceId::new(0, local_id)
}

pub fn flat_scaling() -> ScalingFactors {
    ScalingFactors {
        dynamic: [1.0; 5],
        leakage: [1.0; 5],
        voltage: [1.0; 5],
    }
}

/// Platform of `(local_id, nominal dynamic mW)` clients on the simulated ladder.
///
/// With flat scaling a client draws `dynamic * {0.25, 0.5, 0.75, 1.0, 1.25}` mA
/// from the lowest to the highest level.
pub fn platform(threshold_ma: u64, clients: &[(u32, f64)], eligible: &[u32]) -> PlatformConfig {
    PlatformConfig {
        threshold_ma,
        rate_step_hz: 100 * MHZ,
        callback_timeout_ms: 100,
        scaling: flat_scaling(),
        clients: clients
            .iter()
            .map(|(local_id, dynamic)| ClientConfig {
                id: clk(*local_id),
                name: format!("block{local_id}"),
                nominal_dynamic_mw: *dynamic,
                nominal_leakage_mw: 0.0,
                hw_blocks: vec![1, 2],
            })
            .collect(),
        throttle_eligible: eligible.iter().map(|local_id| clk(*local_id)).collect(),
    }
}

pub fn engine(platform: &PlatformConfig) -> (ResourceEngine<RecordingClock>, RecordingClock) {
    let clock = RecordingClock::default();
    let engine = ResourceEngine::new(clock.clone(), platform).unwrap();
    (engine, clock)
}

pub fn register(engine: &ResourceEngine<RecordingClock>, local_id: u32) -> ClientHandle {
    engine.register(ClientDescriptor::new(clk(local_id))).unwrap()
}

/// Notification sink that counts deliveries and can be told to refuse.
#[derive(Debug, Clone, Default)]
pub struct Listener {
    received: Arc<Mutex<Vec<RateChange>>>,
    refusing: Arc<AtomicBool>,
    refusals: Arc<AtomicU32>,
}

impl Listener {
    pub fn refusing() -> Self {
        let listener = Self::default();
        listener.refusing.store(true, Ordering::SeqCst);
        listener
    }

    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<RateChange> {
        self.received.lock().unwrap().clone()
    }

    pub fn refusals(&self) -> u32 {
        self.refusals.load(Ordering::SeqCst)
    }
}

impl mmrm::NotificationSink for Listener {
    fn notify(&self, change: &RateChange) -> Result<(), NotifyError> {
        if self.refusing.load(Ordering::SeqCst) {
            self.refusals.fetch_add(1, Ordering::SeqCst);
            return Err(report!(NotifyError::new("busy streaming")));
        }
        self.received.lock().unwrap().push(*change);
        Ok(())
    }
}

/// Aggregate matches the per-client contributions and stays under budget.
pub fn assert_consistent(snapshot: &EngineSnapshot) {
    let sum: u64 = snapshot.clients.iter().map(|c| c.contribution_ma).sum();
    assert_eq!(snapshot.aggregate_ma, sum, "{snapshot:#?}");
    assert!(
        snapshot.aggregate_ma <= snapshot.threshold_ma,
        "aggregate over threshold: {snapshot:#?}"
    );
    for client in snapshot.clients.iter().filter(|c| c.rate_hz > 0) {
        assert!(client.level <= snapshot.aggregate_level, "{snapshot:#?}");
    }
}
