//! Two endpoints talking directly over a loopback network

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use pretty_assertions::assert_eq;
use sipdrill_scenario_core::sip::{addr_uri, reason_phrase, FROM};
use sipdrill_scenario_core::{
    DialogState, EndpointOps, HarnessConfig, Inbox, Method, Orchestrator, ProvisionalPolicy, ScenarioResult,
    SipMessage, SipNetwork, SipTransport, TestDefinition,
};

/// Routes requests by Request-URI and responses by From URI, to either an
/// endpoint's contact or its public URI
#[derive(Default)]
struct Loopback {
    inboxes: Arc<DashMap<String, Arc<Inbox>>>,
}

struct LoopbackTransport {
    inboxes: Arc<DashMap<String, Arc<Inbox>>>,
}

#[async_trait]
impl SipTransport for LoopbackTransport {
    async fn send(&self, message: SipMessage) -> ScenarioResult<()> {
        let destination = match &message {
            SipMessage::Request(request) => request.uri.clone(),
            SipMessage::Response(response) => addr_uri(response.header(FROM).unwrap_or_default()).to_string(),
        };
        if let Some(inbox) = self.inboxes.get(&destination) {
            inbox.deliver(message);
        }
        Ok(())
    }
}

#[async_trait]
impl SipNetwork for Loopback {
    fn attach(&self, contact: &str, inbox: Arc<Inbox>) -> ScenarioResult<Arc<dyn SipTransport>> {
        self.inboxes.insert(contact.to_string(), inbox.clone());
        self.inboxes.insert(inbox.owner().to_string(), inbox);
        Ok(Arc::new(LoopbackTransport {
            inboxes: self.inboxes.clone(),
        }))
    }

    fn detach(&self, contact: &str) {
        self.inboxes.remove(contact);
    }

    async fn provision_services(&self, _aor: &str, _simservs_xml: String) -> ScenarioResult<()> {
        Ok(())
    }
}

fn orchestrator() -> Orchestrator {
    Orchestrator::new(HarnessConfig::default(), Arc::new(Loopback::default())).unwrap()
}

fn basic_call(callee_answers: bool) -> TestDefinition {
    TestDefinition::new("basic call", move |t| {
        let caller = t.add_endpoint()?;
        let callee = t.add_endpoint()?;
        let target = callee.uri().to_string();
        let ringing = t.barrier("ringing", 2)?;
        let ringing2 = ringing.clone();

        t.add_scenario("caller", async move {
            let mut call = caller.outgoing_call(&target);
            call.send_invite_with_sdp().await?;
            call.recv_response(180).await?;
            ringing.wait().await?;
            if callee_answers {
                call.recv_response_and_create_dialog(200).await?;
                call.send_request(Method::Ack, "", &[]).await?;
                call.send_request(Method::Bye, "", &[]).await?;
                call.recv_response(200).await?;
            } else {
                call.recv_response(486).await?;
                call.send_request(Method::Ack, "", &[]).await?;
            }
            assert_eq!(call.dialog().state, DialogState::Terminated);
            call.end_call();
            Ok(())
        });

        t.add_scenario("callee", async move {
            let mut call = callee.incoming_call().await?;
            call.recv_request(Method::Invite).await?;
            call.send_response(180, reason_phrase(180)).await?;
            ringing2.wait().await?;
            if callee_answers {
                call.send_200_with_sdp().await?;
                call.recv_request(Method::Ack).await?;
                call.recv_request(Method::Bye).await?;
                call.send_response(200, reason_phrase(200)).await?;
            } else {
                call.send_response(486, reason_phrase(486)).await?;
                call.recv_request(Method::Ack).await?;
            }
            call.end_call();

            // The claimed INVITE still counts until the next checkpoint
            assert!(!callee.no_new_calls());
            assert_eq!(callee.checkpoint(), 1);
            assert!(callee.no_new_calls());
            Ok(())
        });
        Ok(())
    })
}

#[tokio::test]
async fn test_answered_call() {
    let report = orchestrator().run_test(&basic_call(true)).await;
    assert!(report.passed(), "{}", report);
}

#[tokio::test]
async fn test_rejected_call() {
    let report = orchestrator().run_test(&basic_call(false)).await;
    assert!(report.passed(), "{}", report);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_invite_fails_the_caller_only() {
    let definition = TestDefinition::new("no answer", |t| {
        let caller = t.add_endpoint()?;
        let callee = t.add_endpoint()?;
        let target = callee.uri().to_string();
        t.add_scenario("caller", async move {
            let mut call = caller.outgoing_call(&target);
            call.send_invite_with_sdp().await?;
            call.recv_response(200).await?;
            Ok(())
        });
        t.add_cleanup(async move {
            assert!(!callee.no_new_calls());
            Ok(())
        });
        Ok(())
    });

    let report = orchestrator().run_test(&definition).await;
    let failure = report.failure_of("caller").unwrap();
    assert!(failure.is_timeout(), "{}", failure);
    assert!(report.cleanup_errors.is_empty());
}

fn ringing_then_busy() -> TestDefinition {
    TestDefinition::new("ringing then busy", |t| {
        let caller = t.add_endpoint()?;
        let callee = t.add_endpoint()?;
        let target = callee.uri().to_string();
        t.add_scenario("caller", async move {
            let mut call = caller.outgoing_call(&target);
            call.send_invite_with_sdp().await?;
            call.recv_response(486).await?;
            call.send_request(Method::Ack, "", &[]).await?;
            call.end_call();
            Ok(())
        });
        t.add_scenario("callee", async move {
            let mut call = callee.incoming_call().await?;
            call.recv_request(Method::Invite).await?;
            call.send_response(180, reason_phrase(180)).await?;
            call.send_response(181, reason_phrase(181)).await?;
            call.send_response(486, reason_phrase(486)).await?;
            call.recv_request(Method::Ack).await?;
            call.end_call();
            Ok(())
        });
        Ok(())
    })
}

#[tokio::test(start_paused = true)]
async fn test_absorbed_policy_skips_provisionals() {
    let config = HarnessConfig::default().with_provisional_policy(ProvisionalPolicy::Absorbed);
    let orchestrator = Orchestrator::new(config, Arc::new(Loopback::default())).unwrap();
    let report = orchestrator.run_test(&ringing_then_busy()).await;
    assert!(report.passed(), "{}", report);
}

#[tokio::test(start_paused = true)]
async fn test_strict_policy_rejects_unexpected_provisional() {
    let report = orchestrator().run_test(&ringing_then_busy()).await;
    let failure = report.failure_of("caller").unwrap();
    assert!(failure.to_string().contains("expected 486, got 180"), "{}", failure);
}
