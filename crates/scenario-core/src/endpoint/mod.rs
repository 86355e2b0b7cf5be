//! Simulated endpoints and the calls they make
//!
//! An [`Endpoint`] is one user agent of a test: an identity, a registration
//! with the device under test, a diversion-rule configuration and any number
//! of concurrent [`Call`]s, each owning one dialog. Scenarios drive it through
//! the fixed [`EndpointOps`] capability set plus the per-call operations on
//! [`Call`].

mod call;
mod endpoint_impl;
mod identity;
mod inbox;
mod registration;

pub use call::Call;
pub use endpoint_impl::Endpoint;
pub use identity::EndpointIdentity;
pub use inbox::{ClaimedCall, Inbox};
pub use registration::RegistrationState;

use async_trait::async_trait;

use crate::diversion::DiversionRuleSet;
use crate::errors::ScenarioResult;

/// What a scenario can ask of an endpoint
#[async_trait]
pub trait EndpointOps: Send + Sync {
    /// Register, or refresh an existing registration
    async fn register(&self) -> ScenarioResult<()>;

    /// Remove the registration; a no-op when not registered
    async fn unregister(&self) -> ScenarioResult<()>;

    /// Start a call towards `target`; nothing is sent yet
    fn outgoing_call(&self, target: &str) -> Call;

    /// Claim the next inbound call, waiting up to the receive timeout
    async fn incoming_call(&self) -> ScenarioResult<Call>;

    /// Replace the diversion rules and publish them to the device
    async fn set_diversion_rules(&self, rules: DiversionRuleSet) -> ScenarioResult<()>;

    /// True iff no inbound INVITE has arrived since the last checkpoint
    fn no_new_calls(&self) -> bool;
}
