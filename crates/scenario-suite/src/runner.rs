//! Runner configuration and the run loop behind the `sipdrill` binary

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sipdrill_scenario_core::{
    Capabilities, HarnessConfig, Orchestrator, ProvisionalPolicy, ScenarioError, ScenarioResult,
    SipNetwork, SuiteReport,
};
use sipdrill_sim_core::{SimConfig, SimNetwork};
use tracing::info;

use crate::definitions;

/// Prefix of environment overrides, e.g. `SIPDRILL__HARNESS__RECEIVE_TIMEOUT_MS`
pub const ENV_PREFIX: &str = "SIPDRILL";

/// Everything one run needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub harness: HarnessConfig,
    pub sim: SimConfig,
}

impl Default for RunnerConfig {
    /// The simulated core supports every optional feature, so nothing is
    /// skipped by default
    fn default() -> Self {
        Self {
            harness: HarnessConfig::default().with_capabilities(Capabilities::all()),
            sim: SimConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Defaults, then `file` if given, then `SIPDRILL__*` environment
    /// variables
    pub fn load(file: Option<&Path>) -> ScenarioResult<Self> {
        let config: Self = sipdrill_infra_common::config::load_layered(file, Some(ENV_PREFIX))
            .map_err(|e| ScenarioError::config(e.to_string()))?;
        Ok(config.normalized())
    }

    /// Have the device absorb provisional responses, and the scenarios
    /// tolerate it
    pub fn with_absorbed_provisionals(mut self) -> Self {
        self.harness.provisional_policy = ProvisionalPolicy::Absorbed;
        self.normalized()
    }

    /// Keep the harness' policy and the simulated core's behaviour in step,
    /// and serve the harness' domain
    fn normalized(mut self) -> Self {
        if self.harness.provisional_policy == ProvisionalPolicy::Absorbed {
            self.sim.absorb_provisional = true;
        }
        if self.sim.absorb_provisional {
            self.harness.provisional_policy = ProvisionalPolicy::Absorbed;
        }
        if self.sim.domain != self.harness.home_domain {
            // A host derived from the old domain follows it
            if self.sim.host == SimConfig::for_domain(self.sim.domain.clone()).host {
                self.sim.host = SimConfig::for_domain(self.harness.home_domain.clone()).host;
            }
            self.sim.domain = self.harness.home_domain.clone();
        }
        self
    }
}

/// Run the selected tests against a freshly started simulated core
pub async fn run(config: &RunnerConfig, filter: Option<&str>) -> ScenarioResult<SuiteReport> {
    let tests = definitions(filter);
    info!(tests = tests.len(), filter = ?filter, policy = ?config.harness.provisional_policy, "running suite");

    let network: Arc<dyn SipNetwork> = SimNetwork::start(config.sim.clone())?;
    let orchestrator = Orchestrator::new(config.harness.clone(), network)?;
    Ok(orchestrator.run_suite(&tests).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_everything() {
        let config = RunnerConfig::default();
        assert!(config.harness.capabilities.mmtel);
        assert!(config.harness.capabilities.short_registration);
        assert_eq!(config.harness.provisional_policy, ProvisionalPolicy::Strict);
        assert!(!config.sim.absorb_provisional);
    }

    #[test]
    fn test_absorption_is_applied_to_both_sides() {
        let config = RunnerConfig::default().with_absorbed_provisionals();
        assert!(config.sim.absorb_provisional);

        let mut from_sim = RunnerConfig::default();
        from_sim.sim.absorb_provisional = true;
        let from_sim = from_sim.normalized();
        assert_eq!(from_sim.harness.provisional_policy, ProvisionalPolicy::Absorbed);
    }

    #[test]
    fn test_sim_follows_home_domain() {
        let mut config = RunnerConfig::default();
        config.harness.home_domain = "ims.example.net".into();
        let config = config.normalized();
        assert_eq!(config.sim.domain, "ims.example.net");
        assert_eq!(config.sim.host, "core.ims.example.net");
    }
}
