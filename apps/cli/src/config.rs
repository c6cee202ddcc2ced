//! CLI configuration discovery.

use anyhow::Context;
use concord_orchestrator::CoordinatorConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "CONCORD_CONFIG";

/// Configuration file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "concord.toml";

/// Load the coordinator configuration.
///
/// Configuration precedence:
/// 1. `--config` argument
/// 2. `CONCORD_CONFIG` environment variable
/// 3. Local config file (./concord.toml)
/// 4. Defaults (no backends)
///
/// Environment overrides apply in every case.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<CoordinatorConfig> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .or_else(|| {
            let local = PathBuf::from(LOCAL_CONFIG);
            local.exists().then_some(local)
        });

    if let Some(path) = path {
        return CoordinatorConfig::load(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display()));
    }

    debug!("No configuration file found, using defaults");
    let mut config = CoordinatorConfig::default();
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}
