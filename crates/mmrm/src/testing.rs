//! Fixtures shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use error_stack::{report, Result};

use crate::backend::ClockBackend;
use crate::client::ClockSourceId;
use crate::config::{ClientConfig, PlatformConfig, ScalingFactors};
use crate::error::ClockError;

pub(crate) const MHZ: u64 = 1_000_000;

/// Unit scaling: current equals nominal power scaled by frequency, plus leakage.
pub(crate) fn flat_scaling() -> ScalingFactors {
    ScalingFactors {
        dynamic: [1.0; 5],
        leakage: [1.0; 5],
        voltage: [1.0; 5],
    }
}

/// Platform whose clients all run the standard 100..500 MHz ladder.
///
/// With no leakage a client draws `dynamic * {0.25, 0.5, 0.75, 1.0, 1.25}` mA
/// from `LowSvs` to `Turbo`.
pub(crate) fn platform(threshold_ma: u64, clients: &[(u32, f64)]) -> PlatformConfig {
    PlatformConfig {
        threshold_ma,
        rate_step_hz: 100 * MHZ,
        callback_timeout_ms: 100,
        scaling: flat_scaling(),
        clients: clients
            .iter()
            .map(|(local, dynamic)| ClientConfig {
                id: ClockSourceId::new(0, *local),
                name: format!("clk{local}"),
                nominal_dynamic_mw: *dynamic,
                nominal_leakage_mw: 0.0,
                hw_blocks: vec![1, 2],
            })
            .collect(),
        throttle_eligible: Vec::new(),
    }
}

/// Backend mapping rates to corners through a fixed ladder of `(max_rate, corner)`.
#[derive(Debug, Clone)]
pub(crate) struct LadderBackend {
    min: u64,
    max: u64,
    ladder: Vec<(u64, u32)>,
    failing_corner: Option<u64>,
    bounds_available: bool,
    fail_set_rate: Arc<AtomicBool>,
    set_calls: Arc<Mutex<Vec<(ClockSourceId, u64)>>>,
}

impl LadderBackend {
    pub(crate) fn new(min: u64, max: u64, ladder: Vec<(u64, u32)>) -> Self {
        Self {
            min,
            max,
            ladder,
            failing_corner: None,
            bounds_available: true,
            fail_set_rate: Arc::new(AtomicBool::new(false)),
            set_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn standard() -> Self {
        Self::new(
            100 * MHZ,
            500 * MHZ,
            vec![
                (100 * MHZ, 64),
                (200 * MHZ, 128),
                (300 * MHZ, 192),
                (400 * MHZ, 256),
                (500 * MHZ, 384),
            ],
        )
    }

    pub(crate) fn failing_corner_at(mut self, rate: u64) -> Self {
        self.failing_corner = Some(rate);
        self
    }

    pub(crate) fn without_bounds(mut self) -> Self {
        self.bounds_available = false;
        self
    }

    pub(crate) fn fail_set_rate(&self, fail: bool) {
        self.fail_set_rate.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_calls(&self) -> Vec<(ClockSourceId, u64)> {
        self.set_calls.lock().unwrap().clone()
    }
}

impl ClockBackend for LadderBackend {
    fn rate_bounds(&self, _clk: ClockSourceId) -> Result<(u64, u64), ClockError> {
        if !self.bounds_available {
            return Err(report!(ClockError::new("no bounds")));
        }
        Ok((self.min, self.max))
    }

    fn round_rate(&self, _clk: ClockSourceId, target: u64) -> Result<u64, ClockError> {
        Ok(target.clamp(self.min, self.max))
    }

    fn voltage_for_rate(&self, _clk: ClockSourceId, rate: u64) -> Result<u32, ClockError> {
        if self.failing_corner == Some(rate) {
            return Err(report!(ClockError::new("corner lookup failed")));
        }
        self.ladder
            .iter()
            .find(|(max_rate, _)| rate <= *max_rate)
            .map(|(_, corner)| *corner)
            .ok_or_else(|| report!(ClockError::new("rate above ladder")))
    }

    fn set_rate(&self, clk: ClockSourceId, rate: u64) -> Result<(), ClockError> {
        self.set_calls.lock().unwrap().push((clk, rate));
        if self.fail_set_rate.load(Ordering::SeqCst) {
            return Err(report!(ClockError::new("register write failed")));
        }
        Ok(())
    }
}
