//! `reg` event notifier
//!
//! Serves SUBSCRIBEs for the registration state of an address-of-record and
//! sends a NOTIFY carrying a full reginfo document on every subscription
//! transition and every binding change of the watched resource. The
//! subscription lifecycle itself is driven by [`SubscriptionTracker`].

use std::collections::HashMap;

use sipdrill_scenario_core::dialog::generate_tag;
use sipdrill_scenario_core::sip::{
    addr_uri, name_addr, reason_phrase, tag_param, CALL_ID, CONTACT, CSEQ, EVENT, EXPIRES, FROM,
    SUBSCRIPTION_STATE, TO,
};
use sipdrill_scenario_core::subscription::{
    Notification, SubscriptionTracker, REGINFO_CONTENT_TYPE, REG_EVENT,
};
use sipdrill_scenario_core::{Method, SipRequest, SipResponse};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SimConfig;
use crate::events::{core_request, Action, TimerEvent};
use crate::registrar::{ContactChange, Registrar};

/// One subscription dialog, keyed by its Call-ID
#[derive(Debug)]
struct Watch {
    tracker: SubscriptionTracker,
    /// Attachment the SUBSCRIBE came from; NOTIFYs are delivered there
    subscriber_contact: String,
    /// Request-URI of our NOTIFYs
    notify_target: String,
    local_tag: String,
    /// From header of the SUBSCRIBE, echoed as To of our NOTIFYs
    subscriber_from: String,
    version: u32,
    generation: u64,
}

/// Notifier for the `reg` event package
#[derive(Debug)]
pub struct RegEventNotifier {
    host: String,
    default_expires: u32,
    notify_before_ok: bool,
    watches: HashMap<String, Watch>,
    next_generation: u64,
}

impl RegEventNotifier {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            host: config.host.clone(),
            default_expires: config.default_subscribe_expires,
            notify_before_ok: config.notify_before_ok,
            watches: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Whether `call_id` is one of our subscription dialogs
    pub fn owns(&self, call_id: &str) -> bool {
        self.watches.contains_key(call_id)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.watches.len()
    }

    fn reject(from: &str, request: &SipRequest, status: u16) -> Vec<Action> {
        let response = SipResponse::for_request(request, status, reason_phrase(status)).with_to_tag(&generate_tag());
        vec![Action::send(from, response)]
    }

    /// Handle an initial or in-dialog SUBSCRIBE sent by the attachment `from`
    pub fn on_subscribe(
        &mut self,
        from: &str,
        request: &SipRequest,
        registrar: &mut Registrar,
        now: Instant,
    ) -> Vec<Action> {
        if request.header(EVENT).map(|e| e.trim()) != Some(REG_EVENT) {
            debug!(event = ?request.header(EVENT), "unsupported event package");
            return Self::reject(from, request, 489);
        }
        let Some(call_id) = request.header(CALL_ID).map(str::to_string) else {
            return Self::reject(from, request, 400);
        };
        let expires = request
            .header(EXPIRES)
            .and_then(|e| e.trim().parse::<u32>().ok())
            .unwrap_or(self.default_expires);
        let to_tag = request.header(TO).and_then(tag_param).map(str::to_string);

        let generation = self.next_generation;
        self.next_generation += 1;

        let notification = match self.watches.get_mut(&call_id) {
            Some(watch) => {
                let from_tag = request.header(FROM).and_then(tag_param);
                if to_tag.as_deref() != Some(watch.local_tag.as_str())
                    || from_tag != tag_param(&watch.subscriber_from)
                {
                    debug!(%call_id, "SUBSCRIBE tags do not match the subscription dialog");
                    return Self::reject(from, request, 481);
                }
                watch.generation = generation;
                watch.tracker.refresh(expires, now)
            }
            None => {
                if to_tag.is_some() {
                    debug!(%call_id, "in-dialog SUBSCRIBE for unknown subscription");
                    return Self::reject(from, request, 481);
                }
                let resource = request.header(TO).map(addr_uri).unwrap_or_default().to_string();
                let subscriber = request.header(FROM).map(addr_uri).unwrap_or_default().to_string();
                let mut tracker = SubscriptionTracker::new(call_id.clone(), subscriber, resource, REG_EVENT, 1);
                let notification = tracker.subscribe(expires, now);
                self.watches.insert(
                    call_id.clone(),
                    Watch {
                        tracker,
                        subscriber_contact: from.to_string(),
                        notify_target: request
                            .header(CONTACT)
                            .map(addr_uri)
                            .unwrap_or(from)
                            .to_string(),
                        local_tag: generate_tag(),
                        subscriber_from: request.header(FROM).unwrap_or_default().to_string(),
                        version: 0,
                        generation,
                    },
                );
                notification
            }
        };

        let notification = match notification {
            Ok(notification) => notification,
            Err(e) => {
                debug!(%call_id, error = %e, "SUBSCRIBE refused");
                return Self::reject(from, request, 481);
            }
        };

        let Some(watch) = self.watches.get(&call_id) else {
            return Vec::new();
        };
        let granted = watch.tracker.remaining(now);
        let ok = SipResponse::for_request(request, 200, reason_phrase(200))
            .with_to_tag(&watch.local_tag)
            .with_header(EXPIRES, granted.to_string())
            .with_header(CONTACT, format!("<sip:{}>", self.host));
        info!(%call_id, resource = %watch.tracker.record().resource, expires = granted, state = %notification.subscription_state, "subscription updated");

        let ok = Action::send(from, ok);
        let mut actions = self.notify(&call_id, notification, &[], registrar, now);
        if self.notify_before_ok {
            actions.push(ok);
        } else {
            actions.insert(0, ok);
        }
        if let Some(watch) = self.watches.get(&call_id) {
            if let Some(at) = watch.tracker.record().expires_at {
                actions.push(Action::Schedule {
                    at,
                    timer: TimerEvent::SubscriptionExpiry {
                        call_id: call_id.clone(),
                        generation: watch.generation,
                    },
                });
            }
        }
        actions
    }

    /// Send `notification` on the dialog `call_id`. A final notification
    /// drops the watch whether or not its NOTIFY could be built.
    fn notify(
        &mut self,
        call_id: &str,
        notification: Notification,
        changes: &[ContactChange],
        registrar: &mut Registrar,
        now: Instant,
    ) -> Vec<Action> {
        let mut ended;
        let watch = if notification.is_final() {
            let Some(watch) = self.watches.remove(call_id) else {
                return Vec::new();
            };
            ended = watch;
            &mut ended
        } else {
            let Some(watch) = self.watches.get_mut(call_id) else {
                return Vec::new();
            };
            watch
        };
        let resource = watch.tracker.record().resource.clone();
        let document = registrar.reginfo(&resource, watch.version, changes, now);
        watch.version += 1;

        let body = match document.render() {
            Ok(body) => body,
            Err(e) => {
                warn!(%call_id, error = %e, "failed to render reginfo, NOTIFY not sent");
                return Vec::new();
            }
        };
        let request = core_request(&self.host, Method::Notify, &watch.notify_target)
            .with_header(FROM, name_addr(&resource, Some(&watch.local_tag)))
            .with_header(TO, watch.subscriber_from.clone())
            .with_header(CALL_ID, call_id)
            .with_header(CSEQ, format!("{} NOTIFY", notification.cseq))
            .with_header(EVENT, REG_EVENT)
            .with_header(SUBSCRIPTION_STATE, notification.subscription_state.to_string())
            .with_body(REGINFO_CONTENT_TYPE, body);
        debug!(%call_id, cseq = notification.cseq, state = %notification.subscription_state, "NOTIFY");

        vec![Action::send(&watch.subscriber_contact, request)]
    }

    /// Bindings of `aor` changed; notify everyone watching it
    pub fn on_resource_changed(
        &mut self,
        aor: &str,
        changes: &[ContactChange],
        registrar: &mut Registrar,
        now: Instant,
    ) -> Vec<Action> {
        let watching: Vec<(String, Notification)> = self
            .watches
            .iter_mut()
            .filter(|(_, w)| w.tracker.record().resource == aor && !w.tracker.is_terminated())
            .filter_map(|(call_id, w)| match w.tracker.resource_changed(now) {
                Ok(notification) => Some((call_id.clone(), notification)),
                Err(e) => {
                    debug!(%call_id, error = %e, "not notifying");
                    None
                }
            })
            .collect();

        watching
            .into_iter()
            .flat_map(|(call_id, notification)| self.notify(&call_id, notification, changes, registrar, now))
            .collect()
    }

    /// Terminate every live subscription to `aor` from our side
    pub fn deactivate(&mut self, aor: &str, registrar: &mut Registrar, now: Instant) -> Vec<Action> {
        let ending: Vec<(String, Notification)> = self
            .watches
            .iter_mut()
            .filter(|(_, w)| w.tracker.record().resource == aor)
            .filter_map(|(call_id, w)| match w.tracker.deactivate() {
                Ok(notification) => Some((call_id.clone(), notification)),
                Err(e) => {
                    debug!(%call_id, error = %e, "not deactivating");
                    None
                }
            })
            .collect();
        if !ending.is_empty() {
            info!(%aor, subscriptions = ending.len(), "subscriptions deactivated");
        }

        ending
            .into_iter()
            .flat_map(|(call_id, notification)| self.notify(&call_id, notification, &[], registrar, now))
            .collect()
    }

    /// The expiry timer armed for `generation` fired
    pub fn on_expiry(
        &mut self,
        call_id: &str,
        generation: u64,
        registrar: &mut Registrar,
        now: Instant,
    ) -> Vec<Action> {
        let notification = match self.watches.get_mut(call_id) {
            Some(watch) if watch.generation == generation => watch.tracker.expire(now),
            _ => None,
        };
        match notification {
            Some(notification) => {
                info!(%call_id, "subscription timed out");
                self.notify(call_id, notification, &[], registrar, now)
            }
            None => Vec::new(),
        }
    }

    /// Response from the subscriber to one of our NOTIFYs
    pub fn on_response(&mut self, response: &SipResponse) {
        let Some(call_id) = response.header(CALL_ID) else {
            return;
        };
        if response.status == 481 {
            if self.watches.remove(call_id).is_some() {
                info!(%call_id, "subscriber lost the dialog, subscription dropped");
            }
        } else if response.status >= 300 {
            warn!(%call_id, status = response.status, "NOTIFY rejected");
        }
    }
}
