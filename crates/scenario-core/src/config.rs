//! Harness configuration
//!
//! Everything that used to be ambient process state (which device features
//! are enabled, whether the device absorbs provisional responses) is an
//! explicit field here and is handed to the orchestrator at construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ScenarioError, ScenarioResult};

/// How scenarios treat provisional responses the device may absorb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionalPolicy {
    /// `recv_provisional` requires the response; nothing is skipped
    #[default]
    Strict,
    /// `recv_provisional` is a no-op and stray 18x responses ahead of the
    /// next awaited response are recorded and skipped
    Absorbed,
}

/// Optional device features; tests declare which they need
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// MMTEL supplementary services (call diversion) are provisioned
    pub mmtel: bool,
    /// The registrar accepts REGISTER with very short expiry (3s)
    pub short_registration: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            mmtel: true,
            short_registration: true,
        }
    }
}

/// Configuration shared by every test of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Domain of the endpoint URIs
    pub home_domain: String,
    /// Upper bound on every receive
    pub receive_timeout_ms: u64,
    /// Upper bound on every barrier wait
    pub barrier_timeout_ms: u64,
    /// Upper bound on one scenario actor
    pub scenario_timeout_ms: u64,
    /// Expires requested by `Endpoint::register`
    pub register_expires: u32,
    pub provisional_policy: ProvisionalPolicy,
    /// Abort sibling actors as soon as one fails
    pub abort_on_first_failure: bool,
    /// Tests run concurrently by `Orchestrator::run_suite`
    pub max_parallel_tests: usize,
    pub capabilities: Capabilities,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            home_domain: "sipdrill.test".to_string(),
            receive_timeout_ms: 5_000,
            barrier_timeout_ms: 10_000,
            scenario_timeout_ms: 60_000,
            register_expires: 300,
            provisional_policy: ProvisionalPolicy::Strict,
            abort_on_first_failure: true,
            max_parallel_tests: 4,
            capabilities: Capabilities::default(),
        }
    }
}

impl HarnessConfig {
    /// Parse from TOML, missing keys taking their defaults
    pub fn from_toml_str(text: &str) -> ScenarioResult<Self> {
        let config: Self = sipdrill_infra_common::config::from_toml_str(text)
            .map_err(|e| ScenarioError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_provisional_policy(mut self, policy: ProvisionalPolicy) -> Self {
        self.provisional_policy = policy;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn scenario_timeout(&self) -> Duration {
        Duration::from_millis(self.scenario_timeout_ms)
    }

    /// Reject values that would make waits unbounded or meaningless
    pub fn validate(&self) -> ScenarioResult<()> {
        if self.home_domain.trim().is_empty() {
            return Err(ScenarioError::config("home_domain must not be empty"));
        }
        for (name, value) in [
            ("receive_timeout_ms", self.receive_timeout_ms),
            ("barrier_timeout_ms", self.barrier_timeout_ms),
            ("scenario_timeout_ms", self.scenario_timeout_ms),
        ] {
            if value == 0 {
                return Err(ScenarioError::config(format!("{} must be greater than zero", name)));
            }
        }
        if self.register_expires == 0 {
            return Err(ScenarioError::config("register_expires must be greater than zero"));
        }
        if self.max_parallel_tests == 0 {
            return Err(ScenarioError::config("max_parallel_tests must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        config.validate().unwrap();
        assert_eq!(config.provisional_policy, ProvisionalPolicy::Strict);
        assert_eq!(config.receive_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_toml_overrides() {
        let config = HarnessConfig::from_toml_str(
            r#"
            home_domain = "ims.example.net"
            provisional_policy = "absorbed"

            [capabilities]
            mmtel = true
            "#,
        )
        .unwrap();
        assert_eq!(config.home_domain, "ims.example.net");
        assert_eq!(config.provisional_policy, ProvisionalPolicy::Absorbed);
        assert!(config.capabilities.mmtel);
        assert!(!config.capabilities.short_registration);
        assert_eq!(config.register_expires, 300);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = HarnessConfig::from_toml_str("barrier_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, ScenarioError::Configuration { .. }));
    }
}
