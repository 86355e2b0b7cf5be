//! [`SipNetwork`] implementation backed by the simulated core

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sipdrill_scenario_core::diversion::simservs;
use sipdrill_scenario_core::{Inbox, ScenarioError, ScenarioResult, SipMessage, SipNetwork, SipTransport};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::SimConfig;
use crate::core::{Attachments, SimCore};
use crate::error::{SimError, SimResult};
use crate::events::CoreEvent;

/// A running simulated core that endpoints attach to
pub struct SimNetwork {
    config: SimConfig,
    attachments: Attachments,
    events: mpsc::UnboundedSender<CoreEvent>,
    task: JoinHandle<()>,
}

impl fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimNetwork")
            .field("domain", &self.config.domain)
            .field("attached", &self.attachments.len())
            .finish()
    }
}

impl SimNetwork {
    /// Validate `config` and spawn the core's event loop. Must be called
    /// from within a tokio runtime.
    pub fn start(config: SimConfig) -> SimResult<Arc<Self>> {
        config.validate()?;
        let attachments: Attachments = Arc::new(DashMap::new());
        let (events, rx) = mpsc::unbounded_channel();
        let core = SimCore::new(config.clone(), attachments.clone(), events.clone());
        let task = tokio::spawn(core.run_event_loop(rx));
        debug!(domain = %config.domain, "simulated core spawned");

        Ok(Arc::new(Self {
            config,
            attachments,
            events,
            task,
        }))
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Contacts currently attached
    pub fn attached(&self) -> Vec<String> {
        self.attachments.iter().map(|e| e.key().clone()).collect()
    }

    /// Terminate every subscription to the registration state of `aor`.
    /// Each subscriber gets a final NOTIFY with `reason=deactivated`.
    /// Returns how many subscriptions ended.
    pub async fn deactivate_subscriptions(&self, aor: &str) -> SimResult<usize> {
        let (done, ended) = oneshot::channel();
        self.post(CoreEvent::Deactivate {
            aor: aor.to_string(),
            done,
        })?;
        ended.await.map_err(|_| SimError::CoreStopped)
    }

    fn post(&self, event: CoreEvent) -> SimResult<()> {
        self.events.send(event).map_err(|_| SimError::CoreStopped)
    }
}

impl Drop for SimNetwork {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sending half handed to one attached endpoint
struct SimTransport {
    contact: String,
    events: mpsc::UnboundedSender<CoreEvent>,
}

#[async_trait]
impl SipTransport for SimTransport {
    async fn send(&self, message: SipMessage) -> ScenarioResult<()> {
        self.events
            .send(CoreEvent::Inbound {
                from: self.contact.clone(),
                message,
            })
            .map_err(|_| ScenarioError::from(SimError::CoreStopped))
    }
}

#[async_trait]
impl SipNetwork for SimNetwork {
    fn attach(&self, contact: &str, inbox: Arc<Inbox>) -> ScenarioResult<Arc<dyn SipTransport>> {
        match self.attachments.entry(contact.to_string()) {
            Entry::Occupied(_) => {
                return Err(SimError::ContactInUse(contact.to_string()).into());
            }
            Entry::Vacant(slot) => {
                slot.insert(inbox);
            }
        }
        debug!(%contact, "attached");
        Ok(Arc::new(SimTransport {
            contact: contact.to_string(),
            events: self.events.clone(),
        }))
    }

    fn detach(&self, contact: &str) {
        if self.attachments.remove(contact).is_some() {
            debug!(%contact, "detached");
        }
    }

    async fn provision_services(&self, aor: &str, simservs_xml: String) -> ScenarioResult<()> {
        let rules = simservs::parse(&simservs_xml).map_err(|source| SimError::InvalidServices {
            aor: aor.to_string(),
            source,
        })?;
        let (done, applied) = oneshot::channel();
        self.post(CoreEvent::Provision {
            aor: aor.to_string(),
            rules,
            done,
        })?;
        applied.await.map_err(|_| SimError::CoreStopped)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipdrill_scenario_core::sip::{CALL_ID, CSEQ};
    use sipdrill_scenario_core::{Method, SipRequest};

    #[tokio::test]
    async fn test_attach_is_exclusive() {
        let network = SimNetwork::start(SimConfig::default()).unwrap();
        let inbox = Arc::new(Inbox::new("sip:a@sipdrill.test"));
        network.attach("sip:a@ue.invalid", inbox.clone()).unwrap();
        assert!(network.attach("sip:a@ue.invalid", inbox.clone()).is_err());
        assert_eq!(network.attached(), vec!["sip:a@ue.invalid".to_string()]);
        network.detach("sip:a@ue.invalid");
        assert!(network.attach("sip:a@ue.invalid", inbox).is_ok());
    }

    #[tokio::test]
    async fn test_out_of_dialog_request_gets_481() {
        let network = SimNetwork::start(SimConfig::default()).unwrap();
        let inbox = Arc::new(Inbox::new("sip:a@sipdrill.test"));
        let transport = network.attach("sip:a@ue.invalid", inbox.clone()).unwrap();
        let mut rx = inbox.route("nowhere");

        let bye = SipRequest::new(Method::Bye, "sip:b@sipdrill.test")
            .with_header(CALL_ID, "nowhere")
            .with_header(CSEQ, "2 BYE");
        transport.send(bye.into()).await.unwrap();
        let SipMessage::Response(response) = rx.recv().await.unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(response.status, 481);
    }

    #[tokio::test]
    async fn test_bad_services_document() {
        let network = SimNetwork::start(SimConfig::default()).unwrap();
        let err = network
            .provision_services(
                "sip:a@sipdrill.test",
                "<simservs><communication-diversion><ruleset><rule id=\"r\"></rule></ruleset></communication-diversion></simservs>"
                    .to_string(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sip:a@sipdrill.test"));
    }
}
