//! Events consumed by the core's event loop and the effects it produces

use sipdrill_scenario_core::dialog::generate_branch;
use sipdrill_scenario_core::sip::{CONTACT, VIA};
use sipdrill_scenario_core::{DiversionRuleSet, Method, SipMessage, SipRequest};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Input of the event loop
#[derive(Debug)]
pub(crate) enum CoreEvent {
    /// A message sent by the endpoint attached at `from`
    Inbound { from: String, message: SipMessage },
    /// Replace the diversion services of `aor`
    Provision {
        aor: String,
        rules: DiversionRuleSet,
        done: oneshot::Sender<()>,
    },
    /// Terminate every subscription to the registration state of `aor`;
    /// `done` receives how many ended
    Deactivate { aor: String, done: oneshot::Sender<usize> },
    Timer(TimerEvent),
}

/// Deferred work the loop scheduled for itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    RegistrationExpiry {
        aor: String,
        contact: String,
        generation: u64,
    },
    SubscriptionExpiry { call_id: String, generation: u64 },
    /// Ringing on the callee leg `leg` of the call `call_id` ran out
    NoAnswer { call_id: String, leg: String },
}

/// Effect of handling an event
#[derive(Debug)]
pub(crate) enum Action {
    Send { to: String, message: SipMessage },
    Schedule { at: Instant, timer: TimerEvent },
}

impl Action {
    pub(crate) fn send(to: &str, message: impl Into<SipMessage>) -> Self {
        Action::Send {
            to: to.to_string(),
            message: message.into(),
        }
    }
}

/// A request originated by the core itself
pub(crate) fn core_request(host: &str, method: Method, uri: &str) -> SipRequest {
    SipRequest::new(method, uri)
        .with_header(VIA, format!("SIP/2.0/SIM {};branch={}", host, generate_branch()))
        .with_header("Max-Forwards", "70")
        .with_header(CONTACT, format!("<sip:{}>", host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipdrill_scenario_core::sip::header_param;

    #[test]
    fn test_core_requests_get_fresh_branches() {
        let a = core_request("core.x", Method::Bye, "sip:a@ue.invalid");
        let b = core_request("core.x", Method::Bye, "sip:a@ue.invalid");
        let branch = |r: &SipRequest| header_param(r.header(VIA).unwrap_or_default(), "branch").map(str::to_string);
        assert_ne!(branch(&a), branch(&b));
        assert_eq!(a.header(CONTACT), Some("<sip:core.x>"));
    }
}
