//! Concurrent multi-actor SIP scenario orchestration
//!
//! This crate drives simulated SIP endpoints through interleaved call,
//! registration and subscription flows against a device under test, and
//! checks the protocol invariants along the way:
//!
//! - [`dialog`] and [`transaction`]: one call leg's exchanges and state
//! - [`endpoint`]: simulated user agents and the calls they make
//! - [`barrier`]: rendezvous points for concurrently running actors
//! - [`diversion`]: expected call-diversion behaviour
//! - [`subscription`]: reg-event subscription lifecycle and NOTIFY bodies
//! - [`orchestrator`]: test definitions, execution and reports
//!
//! The network itself is a collaborator behind [`transport::SipNetwork`].

pub mod barrier;
pub mod config;
pub mod dialog;
pub mod diversion;
pub mod endpoint;
pub mod errors;
pub mod orchestrator;
pub mod sip;
pub mod subscription;
pub mod transaction;
pub mod transport;
mod xml;

pub use barrier::{Barrier, BarrierWaitResult};
pub use config::{Capabilities, HarnessConfig, ProvisionalPolicy};
pub use dialog::{Dialog, DialogState};
pub use diversion::{
    evaluate, CallConditions, DiversionCondition, DiversionOutcome, DiversionRule,
    DiversionRuleSet,
};
pub use endpoint::{Call, Endpoint, EndpointIdentity, EndpointOps, Inbox, RegistrationState};
pub use errors::{ScenarioError, ScenarioResult};
pub use orchestrator::{
    Capability, Orchestrator, SuiteReport, TestBuilder, TestDefinition, TestOutcome, TestReport,
};
pub use sip::{MediaType, Method, SipMessage, SipRequest, SipResponse};
pub use subscription::{
    NotifySequence, SubscriptionState, SubscriptionStateHeader, SubscriptionTracker,
    TerminationReason, ValidationCollector,
};
pub use transaction::Transaction;
pub use transport::{SipNetwork, SipTransport};
