//! Config command implementation.

use concord_orchestrator::CoordinatorConfig;

/// Execute the config command.
///
/// Prints the configuration after file loading, environment overrides and
/// validation.
pub fn execute(config: &CoordinatorConfig) -> anyhow::Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}
