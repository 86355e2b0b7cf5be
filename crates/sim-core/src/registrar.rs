//! Registrar of the simulated core
//!
//! Keeps the contact bindings of every address-of-record. Each binding has
//! a generation so that an expiry timer armed for an earlier registration
//! is recognised as stale once the binding was refreshed.

use std::collections::HashMap;
use std::time::Duration;

use sipdrill_scenario_core::sip::{addr_uri, header_param, CONTACT, EXPIRES, TO};
use sipdrill_scenario_core::subscription::{
    AorRegistration, AorState, ContactEvent, ContactState, RegContact, RegInfo, RegInfoState,
};
use sipdrill_scenario_core::SipRequest;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SimConfig;

/// One registered contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub id: String,
    pub contact: String,
    /// `urn:uuid:...` from `+sip.instance`
    pub instance: Option<String>,
    pub expires_at: Instant,
    pub generation: u64,
    pub last_event: ContactEvent,
}

impl Binding {
    pub fn remaining(&self, now: Instant) -> u32 {
        u32::try_from(self.expires_at.saturating_duration_since(now).as_secs()).unwrap_or(u32::MAX)
    }
}

/// A binding that was created, refreshed or removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactChange {
    pub binding: Binding,
    pub state: ContactState,
    pub event: ContactEvent,
}

/// What the registrar decided about a REGISTER
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Answer 401 with this nonce
    Challenge { nonce: String },
    /// Answer 423 Interval Too Brief
    TooBrief { min_expires: u32 },
    Accepted {
        aor: String,
        expires: u32,
        changes: Vec<ContactChange>,
    },
}

/// Contact bindings per address-of-record
#[derive(Debug)]
pub struct Registrar {
    bindings: HashMap<String, Vec<Binding>>,
    registration_ids: HashMap<String, String>,
    next_generation: u64,
    min_expires: u32,
    max_expires: u32,
    default_expires: u32,
}

fn instance_of(contact_header: &str) -> Option<String> {
    header_param(contact_header, "+sip.instance")
        .map(|v| v.trim_matches(|c| c == '<' || c == '>').to_string())
}

/// Whether the request carries digest credentials. Only the presence of a
/// response is checked; the digest itself is not verified.
fn has_credentials(request: &SipRequest) -> Option<bool> {
    request
        .header("Authorization")
        .map(|auth| auth.contains("response="))
}

impl Registrar {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            bindings: HashMap::new(),
            registration_ids: HashMap::new(),
            next_generation: 1,
            min_expires: config.min_register_expires,
            max_expires: config.max_register_expires,
            default_expires: config.default_register_expires,
        }
    }

    fn generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn registration_id(&mut self, aor: &str) -> String {
        let next = self.registration_ids.len() + 1;
        self.registration_ids
            .entry(aor.to_string())
            .or_insert_with(|| format!("reg{}", next))
            .clone()
    }

    /// Apply a REGISTER received at `now`
    pub fn register(&mut self, request: &SipRequest, now: Instant) -> RegisterOutcome {
        if has_credentials(request) == Some(false) {
            let nonce = format!("{:08x}{:08x}", rand::random::<u32>(), rand::random::<u32>());
            debug!(nonce = %nonce, "REGISTER without digest response, challenging");
            return RegisterOutcome::Challenge { nonce };
        }

        let aor = request.header(TO).map(addr_uri).unwrap_or_default().to_string();
        self.registration_id(&aor);
        let Some(contact_header) = request.header(CONTACT).map(str::to_string) else {
            // A query: report the current bindings
            return RegisterOutcome::Accepted {
                aor,
                expires: 0,
                changes: Vec::new(),
            };
        };
        let contact = addr_uri(&contact_header).to_string();
        let requested = request
            .header(EXPIRES)
            .and_then(|e| e.trim().parse::<u32>().ok())
            .or_else(|| header_param(&contact_header, "expires").and_then(|e| e.parse().ok()))
            .unwrap_or(self.default_expires);

        if requested == 0 {
            let changes = self.remove(&aor, &contact, ContactEvent::Unregistered);
            info!(%aor, %contact, "binding removed");
            return RegisterOutcome::Accepted {
                aor,
                expires: 0,
                changes,
            };
        }
        if requested < self.min_expires {
            return RegisterOutcome::TooBrief {
                min_expires: self.min_expires,
            };
        }

        let expires = requested.min(self.max_expires);
        let generation = self.generation();
        let expires_at = now + Duration::from_secs(u64::from(expires));
        let bindings = self.bindings.entry(aor.clone()).or_default();
        let binding = match bindings.iter_mut().find(|b| b.contact == contact) {
            Some(existing) => {
                existing.last_event = if expires_at < existing.expires_at {
                    ContactEvent::Shortened
                } else {
                    ContactEvent::Refreshed
                };
                existing.expires_at = expires_at;
                existing.generation = generation;
                existing.instance = instance_of(&contact_header).or(existing.instance.take());
                existing.clone()
            }
            None => {
                let binding = Binding {
                    id: format!("{:08x}", rand::random::<u32>()),
                    contact: contact.clone(),
                    instance: instance_of(&contact_header),
                    expires_at,
                    generation,
                    last_event: ContactEvent::Registered,
                };
                bindings.push(binding.clone());
                binding
            }
        };
        info!(%aor, %contact, expires, event = %binding.last_event, "binding updated");

        RegisterOutcome::Accepted {
            aor,
            expires,
            changes: vec![ContactChange {
                state: ContactState::Active,
                event: binding.last_event,
                binding,
            }],
        }
    }

    fn remove(&mut self, aor: &str, contact: &str, event: ContactEvent) -> Vec<ContactChange> {
        let Some(bindings) = self.bindings.get_mut(aor) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        bindings.retain(|b| {
            if b.contact == contact {
                removed.push(ContactChange {
                    binding: b.clone(),
                    state: ContactState::Terminated,
                    event,
                });
                false
            } else {
                true
            }
        });
        if bindings.is_empty() {
            self.bindings.remove(aor);
        }
        removed
    }

    /// Drop the binding if the timer armed for `generation` is still current
    pub fn expire(&mut self, aor: &str, contact: &str, generation: u64, now: Instant) -> Option<ContactChange> {
        let current = self
            .bindings
            .get(aor)?
            .iter()
            .any(|b| b.contact == contact && b.generation == generation && b.expires_at <= now);
        if !current {
            return None;
        }
        info!(%aor, %contact, "binding expired");
        self.remove(aor, contact, ContactEvent::Expired).into_iter().next()
    }

    pub fn bindings(&self, aor: &str) -> &[Binding] {
        self.bindings.get(aor).map(Vec::as_slice).unwrap_or_default()
    }

    /// Contact a request for `aor` is routed to, if registered
    pub fn contact_for(&self, aor: &str, now: Instant) -> Option<&str> {
        self.bindings(aor)
            .iter()
            .find(|b| b.expires_at > now)
            .map(|b| b.contact.as_str())
    }

    pub fn is_registered(&self, aor: &str, now: Instant) -> bool {
        self.contact_for(aor, now).is_some()
    }

    /// Full-state reginfo document for `aor`. Contacts removed by `changes`
    /// come first, followed by the live bindings.
    pub fn reginfo(&mut self, aor: &str, version: u32, changes: &[ContactChange], now: Instant) -> RegInfo {
        let id = self.registration_id(aor);
        let live = self.bindings(aor);
        let state = if !live.is_empty() {
            AorState::Active
        } else if changes.is_empty() {
            AorState::Init
        } else {
            AorState::Terminated
        };

        let mut registration = AorRegistration::new(aor, id, state);
        for change in changes.iter().filter(|c| c.state == ContactState::Terminated) {
            registration = registration.with_contact(RegContact::new(
                change.binding.id.clone(),
                change.binding.contact.clone(),
                ContactState::Terminated,
                change.event,
            ));
        }
        for binding in live {
            let mut contact = RegContact::new(
                binding.id.clone(),
                binding.contact.clone(),
                ContactState::Active,
                binding.last_event,
            )
            .with_expires(binding.remaining(now));
            if let Some(instance) = &binding.instance {
                contact = contact.with_pub_gruu(format!("{};gr={}", aor, instance));
            }
            registration = registration.with_contact(contact);
        }
        RegInfo::new(version, RegInfoState::Full).with_registration(registration)
    }
}
