//! # sipdrill-scenario-suite
//!
//! The call-diversion and reg-event scenarios, and what the `sipdrill`
//! binary needs to run them: the runner configuration and suite selection.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sipdrill_scenario_core::{Orchestrator, SipNetwork};
//! use sipdrill_scenario_suite::{definitions, RunnerConfig};
//! use sipdrill_sim_core::SimNetwork;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunnerConfig::default();
//! let network: Arc<dyn SipNetwork> = SimNetwork::start(config.sim.clone())?;
//! let orchestrator = Orchestrator::new(config.harness.clone(), network)?;
//! let report = orchestrator.run_suite(&definitions(None)).await;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

pub mod call_diversion;
pub mod runner;
pub mod subscribe;

pub use runner::{run, RunnerConfig};

use sipdrill_scenario_core::TestDefinition;

/// All tests, optionally only those whose name contains `filter`
/// (case-insensitive)
pub fn definitions(filter: Option<&str>) -> Vec<TestDefinition> {
    let filter = filter.map(str::to_lowercase);
    call_diversion::definitions()
        .into_iter()
        .chain(subscribe::definitions())
        .filter(|d| {
            filter
                .as_deref()
                .is_none_or(|f| d.name().to_lowercase().contains(f))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_is_case_insensitive() {
        assert_eq!(definitions(None).len(), 16);
        let names: Vec<String> = definitions(Some("not REACHABLE"))
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names.len(), 4);
        assert!(names.iter().all(|n| n.starts_with("Call Diversion - Not reachable")));
        assert!(definitions(Some("no such test")).is_empty());
    }
}
