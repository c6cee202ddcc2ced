//! CLI command implementations.

pub mod config;
pub mod predict;
pub mod status;

use concord_orchestrator::CoordinatorError;

/// Prints the error report as JSON on stdout and hands the error back for
/// a non-zero exit.
pub(crate) fn report_failure(err: CoordinatorError) -> anyhow::Error {
    if let Ok(report) = serde_json::to_string_pretty(&err.report()) {
        println!("{report}");
    }
    anyhow::Error::new(err)
}
