//! Platform description consumed when the engine is built.

use std::collections::HashSet;
use std::time::Duration;

use error_stack::{report, Result};
use serde::{Deserialize, Serialize};

use crate::client::ClockSourceId;
use crate::level::LevelTable;
use crate::MmrmError;

fn default_rate_step_hz() -> u64 {
    1_000_000
}

fn default_callback_timeout_ms() -> u64 {
    100
}

fn default_hw_blocks() -> Vec<u32> {
    vec![1]
}

/// Global budget, scaling constants and the per-client power description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    /// Peak current threshold of the shared rail in mA.
    pub threshold_ma: u64,
    /// Sampling increment used when deriving frequency tables.
    #[serde(default = "default_rate_step_hz")]
    pub rate_step_hz: u64,
    /// Notification callbacks slower than this are logged.
    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u64,
    pub scaling: ScalingFactors,
    pub clients: Vec<ClientConfig>,
    /// Clients that may be demoted, in the order they are considered.
    #[serde(default)]
    pub throttle_eligible: Vec<ClockSourceId>,
}

/// Platform constants indexed by voltage level, lowest level first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingFactors {
    /// Dynamic power multiplier per level.
    pub dynamic: LevelTable<f64>,
    /// Leakage power multiplier per level.
    pub leakage: LevelTable<f64>,
    /// Rail voltage per level in volts; current = power / voltage.
    pub voltage: LevelTable<f64>,
}

/// Power description of one clock source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(flatten)]
    pub id: ClockSourceId,
    #[serde(default)]
    pub name: String,
    /// Dynamic power at the nominal level in mW.
    pub nominal_dynamic_mw: f64,
    /// Leakage power at the nominal level in mW.
    #[serde(default)]
    pub nominal_leakage_mw: f64,
    /// Legal hardware block counts for this client.
    #[serde(default = "default_hw_blocks")]
    pub hw_blocks: Vec<u32>,
}

impl PlatformConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    /// Checks internal consistency of the description.
    pub fn validate(&self) -> Result<(), MmrmError> {
        if self.threshold_ma == 0 {
            return Err(report!(MmrmError::invalid_config(
                "thresholdMa must be non-zero"
            )));
        }
        if self.rate_step_hz == 0 {
            return Err(report!(MmrmError::invalid_config(
                "rateStepHz must be non-zero"
            )));
        }
        if let Some(v) = self.scaling.voltage.iter().find(|v| !(**v > 0.0)) {
            return Err(report!(MmrmError::invalid_config(format!(
                "voltage factors must be positive, got {v}"
            ))));
        }
        let negative = self
            .scaling
            .dynamic
            .iter()
            .chain(self.scaling.leakage.iter())
            .any(|f| *f < 0.0 || !f.is_finite());
        if negative {
            return Err(report!(MmrmError::invalid_config(
                "power scaling factors must be finite and non-negative"
            )));
        }

        let mut seen = HashSet::new();
        for client in &self.clients {
            if !seen.insert(client.id) {
                return Err(report!(MmrmError::invalid_config(format!(
                    "duplicate client {}",
                    client.id
                ))));
            }
            if client.hw_blocks.is_empty() || client.hw_blocks.contains(&0) {
                return Err(report!(MmrmError::invalid_config(format!(
                    "client {} needs at least one non-zero hwBlocks entry",
                    client.id
                ))));
            }
            if client.nominal_dynamic_mw < 0.0 || client.nominal_leakage_mw < 0.0 {
                return Err(report!(MmrmError::invalid_config(format!(
                    "client {} has negative nominal power",
                    client.id
                ))));
            }
        }

        for id in &self.throttle_eligible {
            if !seen.contains(id) {
                return Err(report!(MmrmError::invalid_config(format!(
                    "throttle eligible client {id} is not described"
                ))));
            }
        }

        Ok(())
    }
}
