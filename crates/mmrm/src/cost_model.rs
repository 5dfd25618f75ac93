//! Per-client frequency, power and current tables.

use crate::backend::ClockBackend;
use crate::client::ClockSourceId;
use crate::config::{ClientConfig, ScalingFactors};
use crate::level::{LevelTable, VoltageLevel};

/// Derived cost model of one clock source.
#[derive(Debug, Clone, PartialEq)]
pub struct CostModel {
    /// Highest rate (Hz) runnable at each level; non-decreasing.
    pub frequency: LevelTable<u64>,
    /// Dynamic power (mW) at each level.
    pub dynamic_power: LevelTable<f64>,
    /// Leakage power (mW) at each level.
    pub leakage_power: LevelTable<f64>,
    /// `current[level][column]`: mA drawn at `level` while the rail sits at `column`.
    pub current: [[u64; VoltageLevel::COUNT]; VoltageLevel::COUNT],
}

impl CostModel {
    /// Samples the backend for `client` and derives its tables.
    pub fn build<B: ClockBackend + ?Sized>(
        backend: &B,
        client: &ClientConfig,
        scaling: &ScalingFactors,
        rate_step_hz: u64,
    ) -> Self {
        let frequency = sample_frequency_table(backend, client.id, rate_step_hz);
        let model = Self::from_frequency_table(
            frequency,
            client.nominal_dynamic_mw,
            client.nominal_leakage_mw,
            scaling,
        );

        tracing::debug!(
            client = %client.id,
            name = %client.name,
            frequency = ?model.frequency,
            "derived client cost model"
        );

        model
    }

    /// Scales the nominal power pair over an existing frequency table.
    pub fn from_frequency_table(
        frequency: LevelTable<u64>,
        nominal_dynamic_mw: f64,
        nominal_leakage_mw: f64,
        scaling: &ScalingFactors,
    ) -> Self {
        let nominal_freq = frequency[VoltageLevel::Nominal.index()];

        let mut dynamic_power = [0.0; VoltageLevel::COUNT];
        let mut leakage_power = [0.0; VoltageLevel::COUNT];
        for level in VoltageLevel::ALL {
            let i = level.index();
            if nominal_freq > 0 {
                dynamic_power[i] = nominal_dynamic_mw * (frequency[i] as f64 / nominal_freq as f64)
                    * scaling.dynamic[i];
            }
            leakage_power[i] = nominal_leakage_mw * scaling.leakage[i];
        }

        let mut current = [[0; VoltageLevel::COUNT]; VoltageLevel::COUNT];
        for (row, level) in current.iter_mut().enumerate() {
            let power = dynamic_power[row] + leakage_power[row];
            for (column, cell) in level.iter_mut().enumerate() {
                *cell = (power / scaling.voltage[column]).round() as u64;
            }
        }

        Self {
            frequency,
            dynamic_power,
            leakage_power,
            current,
        }
    }

    /// Smallest level whose ceiling covers `rate`.
    pub fn level_for_rate(&self, rate: u64) -> Option<VoltageLevel> {
        VoltageLevel::ALL
            .into_iter()
            .find(|level| self.frequency[level.index()] >= rate)
    }

    /// Current in mA drawn at `level` while the rail runs at `column`.
    pub fn current_ma(&self, level: VoltageLevel, column: VoltageLevel) -> u64 {
        self.current[level.index()][column.index()]
    }

    pub fn rate_at(&self, level: VoltageLevel) -> u64 {
        self.frequency[level.index()]
    }

    pub fn max_rate(&self) -> u64 {
        self.rate_at(VoltageLevel::HIGHEST)
    }
}

/// Steps the achievable rate range and records the ceiling of every level.
///
/// The first rate whose corner reaches a level becomes that level's ceiling
/// and is copied into every lower level not reached on its own. Levels above
/// the highest one reached keep the ceiling below them.
fn sample_frequency_table<B: ClockBackend + ?Sized>(
    backend: &B,
    clk: ClockSourceId,
    rate_step_hz: u64,
) -> LevelTable<u64> {
    let mut table = [0u64; VoltageLevel::COUNT];
    let mut filled = [false; VoltageLevel::COUNT];

    let (min, max) = match backend.rate_bounds(clk) {
        Ok(bounds) => bounds,
        Err(err) => {
            tracing::warn!(client = %clk, error = ?err, "clock rate bounds unavailable");
            return table;
        }
    };

    let step = rate_step_hz.max(1);
    let mut rate = backend.round_rate(clk, min).unwrap_or(min);
    while rate <= max {
        match backend.voltage_for_rate(clk, rate) {
            Ok(corner) => {
                let level = VoltageLevel::from_corner(corner);
                if !filled[level.index()] {
                    let lower = table.iter_mut().zip(filled.iter_mut());
                    for (slot, done) in lower.take(level.index() + 1) {
                        if !*done {
                            *slot = rate;
                            *done = true;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::debug!(client = %clk, rate, error = ?err, "no voltage corner for rate");
            }
        }

        if rate >= max {
            break;
        }
        let target = rate.saturating_add(step).min(max);
        let next = backend.round_rate(clk, target).unwrap_or(target);
        if next <= rate {
            break;
        }
        rate = next;
    }

    for i in 1..VoltageLevel::COUNT {
        if !filled[i] {
            table[i] = table[i - 1];
        }
    }

    table
}
