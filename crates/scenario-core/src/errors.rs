//! Error types for scenario-core
//!
//! Every fatal error aborts only the scenario actor (and hence the test) that
//! raised it. Schema problems are the exception: they are collected per test
//! by the [`ValidationCollector`](crate::subscription::ValidationCollector)
//! and reported together as a single [`ScenarioError::Validation`].

use std::time::Duration;

use thiserror::Error;

/// Result type for scenario operations
pub type ScenarioResult<T> = Result<T, ScenarioError>;

/// Errors raised while driving a scenario
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScenarioError {
    /// Unexpected message or bad ordering
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A response arrived that violates provisional-then-final ordering, or
    /// is not the response the scenario expected
    #[error("Unexpected response: expected {expected}, got {received}")]
    UnexpectedResponse { expected: String, received: String },

    /// A response arrived but no client transaction is open
    #[error("No matching transaction for {message}")]
    NoMatchingTransaction { message: String },

    /// Tag or CSeq invariant of a dialog violated
    #[error("Dialog establishment error: {message}")]
    DialogEstablishment { message: String },

    /// Not every party reached a barrier in time
    #[error("Barrier '{name}' timed out in generation {generation}: {arrived}/{parties} parties arrived within {waited:?}")]
    BarrierTimeout {
        name: String,
        generation: u64,
        arrived: usize,
        parties: usize,
        waited: Duration,
    },

    /// A bounded receive expired
    #[error("Timed out after {waited:?} waiting for {waiting_for}")]
    ReceiveTimeout { waiting_for: String, waited: Duration },

    /// One or more message bodies failed schema validation
    #[error("Validation failed: {}", issues.join("; "))]
    Validation { issues: Vec<String> },

    /// Transport could not deliver a message
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Invalid configuration or test definition
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A scenario-level assertion failed
    #[error("Assertion failed: {message}")]
    Assertion { message: String },

    /// XML document could not be produced or read
    #[error("XML error: {message}")]
    Xml { message: String },

    /// The actor was stopped because a sibling failed
    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },
}

impl ScenarioError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn unexpected_response(expected: impl Into<String>, received: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            expected: expected.into(),
            received: received.into(),
        }
    }

    pub fn no_matching_transaction(message: impl Into<String>) -> Self {
        Self::NoMatchingTransaction { message: message.into() }
    }

    pub fn dialog_establishment(message: impl Into<String>) -> Self {
        Self::DialogEstablishment { message: message.into() }
    }

    pub fn receive_timeout(waiting_for: impl Into<String>, waited: Duration) -> Self {
        Self::ReceiveTimeout {
            waiting_for: waiting_for.into(),
            waited,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion { message: message.into() }
    }

    pub fn xml(message: impl Into<String>) -> Self {
        Self::Xml { message: message.into() }
    }

    /// Whether this error was caused by a bounded wait expiring
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::BarrierTimeout { .. } | Self::ReceiveTimeout { .. })
    }
}

/// Fail the current scenario with an assertion error unless `cond` holds.
///
/// ```
/// use sipdrill_scenario_core::{ensure, ScenarioResult};
///
/// fn check(cseq1: u32, cseq2: u32) -> ScenarioResult<()> {
///     ensure!(cseq1 < cseq2, "NOTIFY CSeq not increasing: {} then {}", cseq1, cseq2);
///     Ok(())
/// }
/// assert!(check(1, 2).is_ok());
/// assert!(check(2, 2).is_err());
/// ```
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::ScenarioError::assertion(format!($($arg)+)));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_timeout_message() {
        let err = ScenarioError::BarrierTimeout {
            name: "ringing".into(),
            generation: 0,
            arrived: 1,
            parties: 2,
            waited: Duration::from_secs(5),
        };
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "Barrier 'ringing' timed out in generation 0: 1/2 parties arrived within 5s"
        );
    }

    #[test]
    fn test_validation_issues_are_joined() {
        let err = ScenarioError::Validation {
            issues: vec!["notify1: missing version".into(), "notify2: bad state".into()],
        };
        assert_eq!(
            err.to_string(),
            "Validation failed: notify1: missing version; notify2: bad state"
        );
        assert!(!err.is_timeout());
    }
}
