//! In-memory clock controller used for replays.

use std::collections::HashMap;
use std::sync::Mutex;

use error_stack::{report, Result};
use mmrm::{ClockBackend, ClockError, ClockSourceId};
use serde::{Deserialize, Serialize};

const MHZ: u64 = 1_000_000;

/// Highest rate served by one voltage corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CornerStep {
    pub max_hz: u64,
    pub corner: u32,
}

/// Rate range and voltage ladder of one simulated clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedClock {
    pub min_hz: u64,
    pub max_hz: u64,
    /// Ascending by `max_hz`.
    pub corners: Vec<CornerStep>,
    /// Refuse every forced rate change.
    #[serde(default)]
    pub refuse_notifications: bool,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        let corners = [(200, 64), (300, 128), (400, 192), (500, 256), (600, 384)]
            .into_iter()
            .map(|(mhz, corner)| CornerStep {
                max_hz: mhz * MHZ,
                corner,
            })
            .collect();
        Self {
            min_hz: 200 * MHZ,
            max_hz: 600 * MHZ,
            corners,
            refuse_notifications: false,
        }
    }
}

/// Simulated clock bound to a clock source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSpec {
    #[serde(flatten)]
    pub id: ClockSourceId,
    #[serde(flatten)]
    pub clock: SimulatedClock,
}

/// [`ClockBackend`] over a set of simulated clocks.
///
/// Unlisted clock sources fall back to the default clock.
#[derive(Debug, Default)]
pub struct SimulatedClockBackend {
    clocks: HashMap<ClockSourceId, SimulatedClock>,
    fallback: SimulatedClock,
    programmed: Mutex<HashMap<ClockSourceId, u64>>,
}

impl SimulatedClockBackend {
    pub fn new(specs: &[ClockSpec], fallback: Option<SimulatedClock>) -> Self {
        Self {
            clocks: specs
                .iter()
                .map(|spec| (spec.id, spec.clock.clone()))
                .collect(),
            fallback: fallback.unwrap_or_default(),
            programmed: Mutex::new(HashMap::new()),
        }
    }

    pub fn clock(&self, clk: ClockSourceId) -> &SimulatedClock {
        self.clocks.get(&clk).unwrap_or(&self.fallback)
    }

    /// Last rate written to `clk`, if any.
    pub fn programmed_rate(&self, clk: ClockSourceId) -> Option<u64> {
        self.programmed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&clk)
            .copied()
    }
}

impl ClockBackend for SimulatedClockBackend {
    fn rate_bounds(&self, clk: ClockSourceId) -> Result<(u64, u64), ClockError> {
        let clock = self.clock(clk);
        Ok((clock.min_hz, clock.max_hz))
    }

    fn round_rate(&self, clk: ClockSourceId, target: u64) -> Result<u64, ClockError> {
        let clock = self.clock(clk);
        Ok(target.clamp(clock.min_hz, clock.max_hz))
    }

    fn voltage_for_rate(&self, clk: ClockSourceId, rate: u64) -> Result<u32, ClockError> {
        self.clock(clk)
            .corners
            .iter()
            .find(|step| rate <= step.max_hz)
            .map(|step| step.corner)
            .ok_or_else(|| {
                report!(ClockError::new("no voltage corner serves rate"))
                    .attach_printable(format!("clock: {clk}"))
                    .attach_printable(format!("rate: {rate} Hz"))
            })
    }

    fn set_rate(&self, clk: ClockSourceId, rate: u64) -> Result<(), ClockError> {
        let clock = self.clock(clk);
        if rate != 0 && !(clock.min_hz..=clock.max_hz).contains(&rate) {
            return Err(report!(ClockError::new("rate outside clock range"))
                .attach_printable(format!("clock: {clk}"))
                .attach_printable(format!("rate: {rate} Hz")));
        }
        tracing::debug!(clock = %clk, rate, "programmed simulated clock");
        self.programmed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(clk, rate);
        Ok(())
    }
}
