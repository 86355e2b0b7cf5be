//! Capability traits for the SIP network the scenarios run against
//!
//! The orchestration core never touches sockets. A [`SipNetwork`] attaches
//! each endpoint's contact address to an [`Inbox`] and hands back the
//! [`SipTransport`] the endpoint sends through. Implementations may be a real
//! UDP/TCP stack in front of a device under test or an in-process simulator.

use std::sync::Arc;

use async_trait::async_trait;

use crate::endpoint::Inbox;
use crate::errors::ScenarioResult;
use crate::sip::SipMessage;

/// Outbound half of an endpoint's connection to the network
#[async_trait]
pub trait SipTransport: Send + Sync {
    /// Send a SIP message towards the device under test
    async fn send(&self, message: SipMessage) -> ScenarioResult<()>;
}

/// The network the endpoints of a test are attached to
#[async_trait]
pub trait SipNetwork: Send + Sync {
    /// Start delivering messages addressed to `contact` into `inbox`
    fn attach(&self, contact: &str, inbox: Arc<Inbox>) -> ScenarioResult<Arc<dyn SipTransport>>;

    /// Stop delivering messages to `contact`
    fn detach(&self, contact: &str);

    /// Publish a supplementary-services document for `aor` to the device
    async fn provision_services(&self, aor: &str, simservs_xml: String) -> ScenarioResult<()>;
}
