use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use mmrm::PlatformConfig;
use serde::de::DeserializeOwned;

fn load_yaml<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let yaml_content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} from {}", path.display()))?;
    serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("failed to parse {what} {}", path.display()))
}

/// load and validate a platform description
pub fn load_platform(path: &Path) -> Result<PlatformConfig> {
    tracing::info!("Loading platform description from {:?}", path);

    let platform: PlatformConfig = load_yaml(path, "platform description")?;
    platform
        .validate()
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .with_context(|| format!("invalid platform description {}", path.display()))?;

    tracing::info!(
        "Loaded {} clients, threshold {} mA",
        platform.clients.len(),
        platform.threshold_ma
    );
    Ok(platform)
}

pub fn load_trace(path: &Path) -> Result<crate::replay::Trace> {
    tracing::info!("Loading request trace from {:?}", path);
    load_yaml(path, "request trace")
}
