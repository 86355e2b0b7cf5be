//! The simulated user agent a scenario drives

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::call::Call;
use super::identity::EndpointIdentity;
use super::inbox::Inbox;
use super::registration::{granted_expires, RegistrationLeg, RegistrationState};
use super::EndpointOps;
use crate::config::HarnessConfig;
use crate::diversion::{simservs, DiversionRuleSet};
use crate::errors::{ScenarioError, ScenarioResult};
use crate::sip::SipMessage;
use crate::transport::{SipNetwork, SipTransport};

struct EndpointInner {
    identity: EndpointIdentity,
    config: Arc<HarnessConfig>,
    network: Arc<dyn SipNetwork>,
    inbox: Arc<Inbox>,
    transport: Arc<dyn SipTransport>,
    /// Serializes REGISTER exchanges
    registration: tokio::sync::Mutex<RegistrationLeg>,
    state: RwLock<RegistrationState>,
    rules: RwLock<Arc<DiversionRuleSet>>,
    /// Call-IDs of live calls, in creation order
    active_calls: Mutex<Vec<String>>,
}

/// A simulated endpoint. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("uri", &self.inner.identity.uri)
            .field("contact", &self.inner.identity.contact)
            .field("registration", &*self.inner.state.read())
            .field("active_calls", &self.inner.active_calls.lock().len())
            .finish()
    }
}

impl Endpoint {
    /// Create an endpoint and attach its contact address to `network`
    pub fn new(
        identity: EndpointIdentity,
        config: Arc<HarnessConfig>,
        network: Arc<dyn SipNetwork>,
    ) -> ScenarioResult<Self> {
        let inbox = Arc::new(Inbox::new(identity.uri.clone()));
        let transport = network.attach(&identity.contact, inbox.clone())?;
        let registration = RegistrationLeg::new(&identity, &inbox);
        debug!(uri = %identity.uri, contact = %identity.contact, "endpoint attached");

        Ok(Self {
            inner: Arc::new(EndpointInner {
                identity,
                config,
                network,
                inbox,
                transport,
                registration: tokio::sync::Mutex::new(registration),
                state: RwLock::new(RegistrationState::Unregistered),
                rules: RwLock::new(Arc::new(DiversionRuleSet::default())),
                active_calls: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn identity(&self) -> &EndpointIdentity {
        &self.inner.identity
    }

    pub fn uri(&self) -> &str {
        &self.inner.identity.uri
    }

    pub fn private_id(&self) -> &str {
        &self.inner.identity.private_id
    }

    pub fn password(&self) -> &str {
        &self.inner.identity.password
    }

    pub fn contact(&self) -> &str {
        &self.inner.identity.contact
    }

    pub fn expected_pub_gruu(&self) -> String {
        self.inner.identity.expected_pub_gruu()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.inner.config
    }

    pub fn registration_state(&self) -> RegistrationState {
        *self.inner.state.read()
    }

    /// The rule set last configured with `set_diversion_rules`
    pub fn diversion_rules(&self) -> Arc<DiversionRuleSet> {
        self.inner.rules.read().clone()
    }

    /// Call-IDs of the calls currently open on this endpoint
    pub fn active_calls(&self) -> Vec<String> {
        self.inner.active_calls.lock().clone()
    }

    /// Forget inbound INVITEs nobody claimed and reset `no_new_calls`.
    /// Returns how many INVITEs arrived since the previous checkpoint.
    pub fn checkpoint(&self) -> usize {
        self.inner.inbox.checkpoint()
    }

    pub(crate) fn inbox(&self) -> &Inbox {
        &self.inner.inbox
    }

    pub(crate) async fn send(&self, message: SipMessage) -> ScenarioResult<()> {
        debug!(endpoint = %self.inner.identity.uri, message = %message.summary(), "sending");
        self.inner.transport.send(message).await
    }

    pub(crate) fn track_call(&self, call_id: &str) {
        self.inner.active_calls.lock().push(call_id.to_string());
    }

    pub(crate) fn forget_call(&self, call_id: &str) {
        self.inner.inbox.release(call_id);
        self.inner.active_calls.lock().retain(|c| c != call_id);
    }

    /// Stop receiving from the network. Calls still open see their channels
    /// close.
    pub fn detach(&self) {
        debug!(uri = %self.inner.identity.uri, "endpoint detached");
        self.inner.network.detach(&self.inner.identity.contact);
    }

    /// REGISTER with an explicit expiry, returning the expiry granted
    pub async fn register_with_expires(&self, expires: u32) -> ScenarioResult<u32> {
        let mut leg = self.inner.registration.lock().await;
        let (request, mut transaction) = leg.next_request(&self.inner.identity, expires);
        self.send(request.into()).await?;
        let response = leg
            .await_final(&mut transaction, self.inner.config.receive_timeout())
            .await?;

        match response.status {
            200..=299 => {
                let granted = granted_expires(&response, expires);
                *self.inner.state.write() = if granted == 0 {
                    RegistrationState::Unregistered
                } else {
                    RegistrationState::Registered { expires: granted }
                };
                info!(uri = %self.inner.identity.uri, expires = granted, call_id = %leg.call_id(), "registered");
                Ok(granted)
            }
            401 | 407 => Err(ScenarioError::protocol(format!(
                "registrar challenged REGISTER for {} with {}; endpoints do not answer digest challenges",
                self.inner.identity.uri, response.status
            ))),
            _ => Err(ScenarioError::unexpected_response(
                "2xx to REGISTER",
                SipMessage::Response(response).summary(),
            )),
        }
    }
}

#[async_trait]
impl EndpointOps for Endpoint {
    async fn register(&self) -> ScenarioResult<()> {
        self.register_with_expires(self.inner.config.register_expires)
            .await
            .map(|_| ())
    }

    async fn unregister(&self) -> ScenarioResult<()> {
        let previous = self.registration_state();
        if previous == RegistrationState::Unregistered {
            debug!(uri = %self.inner.identity.uri, "not registered, nothing to remove");
            return Ok(());
        }

        *self.inner.state.write() = RegistrationState::Expiring;
        match self.register_with_expires(0).await {
            Ok(_) => {
                *self.inner.state.write() = RegistrationState::Unregistered;
                info!(uri = %self.inner.identity.uri, "unregistered");
                Ok(())
            }
            Err(e) => {
                warn!(uri = %self.inner.identity.uri, error = %e, "unregister failed");
                *self.inner.state.write() = previous;
                Err(e)
            }
        }
    }

    fn outgoing_call(&self, target: &str) -> Call {
        Call::outgoing(self.clone(), target)
    }

    async fn incoming_call(&self) -> ScenarioResult<Call> {
        let claimed = self
            .inner
            .inbox
            .claim_next(self.inner.config.receive_timeout())
            .await?;
        Call::incoming(self.clone(), claimed)
    }

    async fn set_diversion_rules(&self, rules: DiversionRuleSet) -> ScenarioResult<()> {
        let document = simservs::render(&rules)?;
        *self.inner.rules.write() = Arc::new(rules);
        debug!(uri = %self.inner.identity.uri, "diversion rules replaced");
        self.inner
            .network
            .provision_services(&self.inner.identity.uri, document)
            .await
    }

    fn no_new_calls(&self) -> bool {
        self.inner.inbox.no_new_calls()
    }
}
