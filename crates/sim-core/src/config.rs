//! Simulated core configuration

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Behaviour knobs of the simulated core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Home domain served by the registrar
    pub domain: String,
    /// Host the core puts in its Via and Contact headers
    pub host: String,
    /// Shortest registration accepted; shorter ones get 423
    pub min_register_expires: u32,
    /// Longer registrations are cut down to this
    pub max_register_expires: u32,
    /// Used when a REGISTER carries no expiry
    pub default_register_expires: u32,
    /// Used when a SUBSCRIBE carries no Expires
    pub default_subscribe_expires: u32,
    /// Diversions allowed for one call before it is rejected
    pub max_diversions: u32,
    /// Forward only the first provisional response of a call to the caller
    pub absorb_provisional: bool,
    /// Send the initial NOTIFY ahead of the 200 to SUBSCRIBE
    pub notify_before_ok: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            domain: "sipdrill.test".to_string(),
            host: "core.sipdrill.test".to_string(),
            min_register_expires: 1,
            max_register_expires: 3600,
            default_register_expires: 300,
            default_subscribe_expires: 3600,
            max_diversions: 5,
            absorb_provisional: false,
            notify_before_ok: false,
        }
    }
}

impl SimConfig {
    pub fn for_domain(domain: impl Into<String>) -> Self {
        let domain = domain.into();
        Self {
            host: format!("core.{}", domain),
            domain,
            ..Default::default()
        }
    }

    pub fn with_absorb_provisional(mut self, absorb: bool) -> Self {
        self.absorb_provisional = absorb;
        self
    }

    pub fn with_min_register_expires(mut self, secs: u32) -> Self {
        self.min_register_expires = secs;
        self
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.domain.is_empty() || self.host.is_empty() {
            return Err(SimError::Config("domain and host must be set".into()));
        }
        if self.min_register_expires == 0 || self.min_register_expires > self.max_register_expires {
            return Err(SimError::Config(format!(
                "register expiry bounds {}..{} are invalid",
                self.min_register_expires, self.max_register_expires
            )));
        }
        if self.default_subscribe_expires == 0 {
            return Err(SimError::Config("default_subscribe_expires must be greater than zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        SimConfig::default().validate().unwrap();
        let config = SimConfig::for_domain("ims.example");
        assert_eq!(config.host, "core.ims.example");
    }

    #[test]
    fn test_bad_bounds() {
        let config = SimConfig::default().with_min_register_expires(7200);
        assert!(matches!(config.validate(), Err(SimError::Config(_))));
    }
}
