//! Scenario orchestration
//!
//! A [`TestDefinition`] is a name plus a build function. For every run the
//! [`Orchestrator`] hands the build function a fresh [`TestBuilder`], which
//! declares endpoints, barriers and the setup, scenario and cleanup steps.
//! Setup runs in order, then every scenario actor runs as its own task,
//! then cleanup runs whatever happened before it.

mod definition;
mod report;
mod runner;

pub use definition::{Capability, StepFuture, TestBuilder, TestDefinition};
pub use report::{ActorFailure, SuiteReport, TestOutcome, TestReport};
pub use runner::Orchestrator;
