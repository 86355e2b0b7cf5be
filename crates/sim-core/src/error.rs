use sipdrill_scenario_core::ScenarioError;
use thiserror::Error;

/// Result type for the simulated core
pub type SimResult<T> = Result<T, SimError>;

/// Errors raised by the simulated core
#[derive(Debug, Error)]
pub enum SimError {
    /// The event loop is gone; nothing can be delivered any more
    #[error("Simulated core is not running")]
    CoreStopped,

    #[error("Contact {0} is already attached")]
    ContactInUse(String),

    #[error("Invalid services document for {aor}: {source}")]
    InvalidServices {
        aor: String,
        #[source]
        source: ScenarioError,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<SimError> for ScenarioError {
    fn from(e: SimError) -> Self {
        match e {
            SimError::CoreStopped | SimError::ContactInUse(_) => ScenarioError::transport(e.to_string()),
            SimError::InvalidServices { .. } => ScenarioError::xml(e.to_string()),
            SimError::Config(message) => ScenarioError::config(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_keeps_category() {
        let err: ScenarioError = SimError::CoreStopped.into();
        assert!(matches!(err, ScenarioError::Transport { .. }));

        let err: ScenarioError = SimError::InvalidServices {
            aor: "sip:a@x".into(),
            source: ScenarioError::xml("unexpected end"),
        }
        .into();
        assert!(err.to_string().contains("sip:a@x"));
    }
}
