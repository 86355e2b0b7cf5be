//! The simulated core's event loop
//!
//! All state lives in one task. Endpoints post inbound messages, provisioning
//! requests and timer expiries into the loop's channel; each event is handled
//! to completion and yields a list of [`Action`]s which the loop then
//! executes, delivering messages into the addressed endpoint's inbox or
//! arming a timer that posts back into the same channel.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use sipdrill_infra_common::logging::LogContext;
use sipdrill_scenario_core::dialog::generate_tag;
use sipdrill_scenario_core::sip::{reason_phrase, CALL_ID, CONTACT, EXPIRES};
use sipdrill_scenario_core::subscription::ContactState;
use sipdrill_scenario_core::{DiversionRuleSet, Inbox, Method, SipMessage, SipRequest, SipResponse};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, Instrument, Level};

use crate::b2bua::{B2bua, Routing};
use crate::config::SimConfig;
use crate::events::{Action, CoreEvent, TimerEvent};
use crate::notifier::RegEventNotifier;
use crate::registrar::{RegisterOutcome, Registrar};

/// Endpoint inboxes by contact address
pub(crate) type Attachments = Arc<DashMap<String, Arc<Inbox>>>;

pub(crate) struct SimCore {
    config: SimConfig,
    attachments: Attachments,
    events: mpsc::UnboundedSender<CoreEvent>,
    registrar: Registrar,
    notifier: RegEventNotifier,
    b2bua: B2bua,
    services: HashMap<String, DiversionRuleSet>,
}

impl SimCore {
    pub(crate) fn new(
        config: SimConfig,
        attachments: Attachments,
        events: mpsc::UnboundedSender<CoreEvent>,
    ) -> Self {
        Self {
            registrar: Registrar::new(&config),
            notifier: RegEventNotifier::new(&config),
            b2bua: B2bua::new(&config),
            services: HashMap::new(),
            config,
            attachments,
            events,
        }
    }

    /// Process events until every sender is gone
    pub(crate) async fn run_event_loop(mut self, mut rx: mpsc::UnboundedReceiver<CoreEvent>) {
        let span = LogContext::with_operation("sim-core", "event_loop")
            .with_field("domain", &self.config.domain)
            .span(Level::INFO);
        async move {
            info!("simulated core started");
            while let Some(event) = rx.recv().await {
                let actions = self.handle_event(event);
                self.execute(actions);
                trace!(
                    calls = self.b2bua.active_calls(),
                    subscriptions = self.notifier.active_subscriptions(),
                    "event handled"
                );
            }
            info!("simulated core stopped");
        }
        .instrument(span)
        .await
    }

    fn handle_event(&mut self, event: CoreEvent) -> Vec<Action> {
        let now = Instant::now();
        match event {
            CoreEvent::Inbound { from, message } => {
                trace!(%from, message = %message.summary(), "inbound");
                match message {
                    SipMessage::Request(request) => self.on_request(&from, request, now),
                    SipMessage::Response(response) => self.on_response(response, now),
                }
            }
            CoreEvent::Provision { aor, rules, done } => {
                info!(%aor, active = rules.active, rules = rules.rules.len(), "services provisioned");
                self.services.insert(aor, rules);
                let _ = done.send(());
                Vec::new()
            }
            CoreEvent::Deactivate { aor, done } => {
                let actions = self.notifier.deactivate(&aor, &mut self.registrar, now);
                let _ = done.send(actions.len());
                actions
            }
            CoreEvent::Timer(timer) => self.on_timer(timer, now),
        }
    }

    fn on_request(&mut self, from: &str, request: SipRequest, now: Instant) -> Vec<Action> {
        let call_id = request.header(CALL_ID).unwrap_or_default().to_string();
        match request.method {
            Method::Register => self.on_register(from, &request, now),
            Method::Subscribe => self.notifier.on_subscribe(from, &request, &mut self.registrar, now),
            _ if self.b2bua.owns_call(&call_id) => self.b2bua.on_caller_request(from, &request),
            _ if self.b2bua.owns_leg(&call_id) => self.b2bua.on_leg_request(from, &request),
            Method::Invite => {
                let routing = Routing {
                    registrar: &self.registrar,
                    services: &self.services,
                    now,
                };
                self.b2bua.on_invite(from, &request, &routing)
            }
            Method::Ack => {
                debug!(%call_id, "stray ACK absorbed");
                Vec::new()
            }
            _ => {
                debug!(%call_id, method = %request.method, "request outside any dialog");
                vec![Action::send(
                    from,
                    SipResponse::for_request(&request, 481, reason_phrase(481)).with_to_tag(&generate_tag()),
                )]
            }
        }
    }

    fn on_response(&mut self, response: SipResponse, now: Instant) -> Vec<Action> {
        let call_id = response.header(CALL_ID).unwrap_or_default().to_string();
        if self.notifier.owns(&call_id) {
            self.notifier.on_response(&response);
            Vec::new()
        } else if self.b2bua.owns_leg(&call_id) {
            let routing = Routing {
                registrar: &self.registrar,
                services: &self.services,
                now,
            };
            self.b2bua.on_leg_response(&response, &routing)
        } else if self.b2bua.owns_call(&call_id) {
            self.b2bua.on_caller_response(&response);
            Vec::new()
        } else {
            debug!(%call_id, status = response.status, "response for unknown dialog dropped");
            Vec::new()
        }
    }

    fn on_register(&mut self, from: &str, request: &SipRequest, now: Instant) -> Vec<Action> {
        let tag = generate_tag();
        match self.registrar.register(request, now) {
            RegisterOutcome::Challenge { nonce } => {
                let challenge = SipResponse::for_request(request, 401, reason_phrase(401))
                    .with_to_tag(&tag)
                    .with_header(
                        "WWW-Authenticate",
                        format!(
                            "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5, qop=\"auth\"",
                            self.config.domain, nonce
                        ),
                    );
                vec![Action::send(from, challenge)]
            }
            RegisterOutcome::TooBrief { min_expires } => {
                let response = SipResponse::for_request(request, 423, "Interval Too Brief")
                    .with_to_tag(&tag)
                    .with_header("Min-Expires", min_expires.to_string());
                vec![Action::send(from, response)]
            }
            RegisterOutcome::Accepted { aor, expires, changes } => {
                let mut ok = SipResponse::for_request(request, 200, reason_phrase(200))
                    .with_to_tag(&tag)
                    .with_header(EXPIRES, expires.to_string());
                for binding in self.registrar.bindings(&aor) {
                    ok.headers.push(
                        CONTACT,
                        format!("<{}>;expires={}", binding.contact, binding.remaining(now)),
                    );
                }

                let mut actions = vec![Action::send(from, ok)];
                for change in changes.iter().filter(|c| c.state == ContactState::Active) {
                    actions.push(Action::Schedule {
                        at: change.binding.expires_at,
                        timer: TimerEvent::RegistrationExpiry {
                            aor: aor.clone(),
                            contact: change.binding.contact.clone(),
                            generation: change.binding.generation,
                        },
                    });
                }
                if !changes.is_empty() {
                    actions.extend(self.notifier.on_resource_changed(&aor, &changes, &mut self.registrar, now));
                }
                actions
            }
        }
    }

    fn on_timer(&mut self, timer: TimerEvent, now: Instant) -> Vec<Action> {
        match timer {
            TimerEvent::RegistrationExpiry { aor, contact, generation } => {
                match self.registrar.expire(&aor, &contact, generation, now) {
                    Some(change) => self.notifier.on_resource_changed(&aor, &[change], &mut self.registrar, now),
                    None => Vec::new(),
                }
            }
            TimerEvent::SubscriptionExpiry { call_id, generation } => {
                self.notifier.on_expiry(&call_id, generation, &mut self.registrar, now)
            }
            TimerEvent::NoAnswer { call_id, leg } => {
                let routing = Routing {
                    registrar: &self.registrar,
                    services: &self.services,
                    now,
                };
                self.b2bua.on_no_answer(&call_id, &leg, &routing)
            }
        }
    }

    fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { to, message } => match self.attachments.get(&to) {
                    Some(inbox) => {
                        trace!(%to, message = %message.summary(), "outbound");
                        inbox.deliver(message);
                    }
                    None => debug!(%to, message = %message.summary(), "no endpoint attached, message dropped"),
                },
                Action::Schedule { at, timer } => {
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep_until(at).await;
                        let _ = events.send(CoreEvent::Timer(timer));
                    });
                }
            }
        }
    }
}
