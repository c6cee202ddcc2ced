//! Status command implementation.

use super::report_failure;
use concord_orchestrator::{Coordinator, CoordinatorConfig};

/// Execute the status command.
///
/// Shows backend reachability, circuit state and cache counters as JSON.
/// Nothing is known about reachability until `probe` is set.
pub async fn execute(config: CoordinatorConfig, probe: bool) -> anyhow::Result<()> {
    let coordinator = Coordinator::from_config(config).map_err(report_failure)?;
    if probe {
        coordinator.probe_backends().await;
    }

    let status = coordinator.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    if !status.ready {
        anyhow::bail!("no backend is reachable");
    }
    Ok(())
}
