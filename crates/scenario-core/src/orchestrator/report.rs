//! Outcome of running tests

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::errors::ScenarioError;

fn display<S: Serializer>(error: &ScenarioError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// One actor's fatal error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActorFailure {
    pub actor: String,
    #[serde(serialize_with = "display")]
    pub error: ScenarioError,
}

impl fmt::Display for ActorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.actor, self.error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed { failures: Vec<ActorFailure> },
    Skipped { reason: String },
}

impl TestOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, TestOutcome::Failed { .. })
    }
}

/// Result of one test
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub name: String,
    #[serde(flatten)]
    pub outcome: TestOutcome,
    /// Actors stopped because a sibling failed
    pub cancelled: Vec<String>,
    /// Cleanup errors; logged, never part of the outcome
    pub cleanup_errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.outcome == TestOutcome::Passed
    }

    /// Failures of the given actor, if any
    pub fn failure_of(&self, actor: &str) -> Option<&ScenarioError> {
        match &self.outcome {
            TestOutcome::Failed { failures } => failures
                .iter()
                .find(|f| f.actor == actor)
                .map(|f| &f.error),
            _ => None,
        }
    }
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            TestOutcome::Passed => write!(f, "PASS  {} ({} ms)", self.name, self.duration_ms),
            TestOutcome::Skipped { reason } => write!(f, "SKIP  {} ({})", self.name, reason),
            TestOutcome::Failed { failures } => {
                write!(f, "FAIL  {} ({} ms)", self.name, self.duration_ms)?;
                for failure in failures {
                    write!(f, "\n      {}", failure)?;
                }
                if !self.cancelled.is_empty() {
                    write!(f, "\n      cancelled: {}", self.cancelled.join(", "))?;
                }
                Ok(())
            }
        }
    }
}

/// Results of a set of tests, in definition order
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuiteReport {
    pub tests: Vec<TestReport>,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SuiteReport {
    pub fn new(tests: Vec<TestReport>) -> Self {
        let mut report = Self::default();
        for test in &tests {
            match test.outcome {
                TestOutcome::Passed => report.passed += 1,
                TestOutcome::Failed { .. } => report.failed += 1,
                TestOutcome::Skipped { .. } => report.skipped += 1,
            }
        }
        report.tests = tests;
        report
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn get(&self, name: &str) -> Option<&TestReport> {
        self.tests.iter().find(|t| t.name == name)
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for test in &self.tests {
            writeln!(f, "{}", test)?;
        }
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.passed, self.failed, self.skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, outcome: TestOutcome) -> TestReport {
        TestReport {
            name: name.to_string(),
            outcome,
            cancelled: Vec::new(),
            cleanup_errors: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 12,
        }
    }

    #[test]
    fn test_suite_counts() {
        let suite = SuiteReport::new(vec![
            report("a", TestOutcome::Passed),
            report("b", TestOutcome::Skipped { reason: "requires mmtel".into() }),
            report(
                "c",
                TestOutcome::Failed {
                    failures: vec![ActorFailure {
                        actor: "caller".into(),
                        error: ScenarioError::assertion("no 181"),
                    }],
                },
            ),
        ]);
        assert_eq!((suite.passed, suite.failed, suite.skipped), (1, 1, 1));
        assert!(!suite.is_success());
        assert!(suite.get("c").and_then(|t| t.failure_of("caller")).is_some());
        assert!(suite.to_string().ends_with("1 passed, 1 failed, 1 skipped"));
    }

    #[test]
    fn test_json_shape() {
        let failed = report(
            "diversion",
            TestOutcome::Failed {
                failures: vec![ActorFailure {
                    actor: "callee".into(),
                    error: ScenarioError::protocol("second final"),
                }],
            },
        );
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["failures"][0]["actor"], "callee");
        assert_eq!(value["failures"][0]["error"], "Protocol error: second final");
    }
}
