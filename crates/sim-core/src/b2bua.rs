//! Call routing with communication diversion
//!
//! Every INVITE reaching the core becomes a [`BridgedCall`]: the caller's
//! dialog is terminated here and a separate callee leg is opened towards the
//! registered contact of the dialled address-of-record. Before and after each
//! leg the callee's diversion services are evaluated; a matching rule sends
//! `181 Call Is Being Forwarded` to the caller and re-routes the call to the
//! rule's target.
//!
//! Each callee leg presents its own To tag to the caller, so provisional
//! responses relayed from successive legs are distinguishable.

use std::collections::HashMap;

use sipdrill_scenario_core::dialog::{generate_call_id, generate_tag};
use sipdrill_scenario_core::diversion::{
    conditions_for_final_response, is_valid_target_uri, RingingTimer,
};
use sipdrill_scenario_core::sip::{
    addr_uri, name_addr, reason_phrase, sdp, tag_param, CSeq, CALL_ID, CONTACT, CONTENT_TYPE, CSEQ,
    FROM, TO, VIA,
};
use sipdrill_scenario_core::{
    evaluate, CallConditions, DiversionCondition, DiversionOutcome, DiversionRuleSet, MediaType,
    Method, SipRequest, SipResponse,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SimConfig;
use crate::events::{core_request, Action, TimerEvent};
use crate::registrar::Registrar;

/// What the router needs to know about the rest of the core
pub struct Routing<'a> {
    pub registrar: &'a Registrar,
    pub services: &'a HashMap<String, DiversionRuleSet>,
    pub now: Instant,
}

impl Routing<'_> {
    fn rules(&self, aor: &str) -> Option<&DiversionRuleSet> {
        self.services.get(aor)
    }

    fn is_routable(&self, aor: &str) -> bool {
        self.registrar.is_registered(aor, self.now) || self.services.contains_key(aor)
    }
}

/// Leg from the core to one callee contact
#[derive(Debug)]
struct CalleeLeg {
    call_id: String,
    /// Attachment the leg was sent to
    contact: String,
    aor: String,
    remote_tag: Option<String>,
    invite: SipRequest,
    cseq: u32,
    /// To tag the caller sees for this leg
    caller_tag: String,
    rang: bool,
    ringing_timer: Option<RingingTimer>,
    answered: bool,
}

impl CalleeLeg {
    /// In-dialog request on the leg. CANCEL and ACK reuse the INVITE's Via.
    fn request(&self, host: &str, method: Method, cseq: u32) -> SipRequest {
        let mut request = core_request(host, method.clone(), &self.contact)
            .with_header(FROM, self.invite.header(FROM).unwrap_or_default().to_string())
            .with_header(TO, name_addr(&self.aor, self.remote_tag.as_deref()))
            .with_header(CALL_ID, self.call_id.clone())
            .with_header(CSEQ, CSeq::new(cseq, method.clone()).to_string());
        if matches!(method, Method::Cancel | Method::Ack) && !self.answered {
            if let Some(via) = self.invite.header(VIA) {
                request.headers.set(VIA, via);
            }
        }
        if method == Method::Cancel {
            request.headers.set(TO, name_addr(&self.aor, None));
        }
        request
    }
}

/// A call bridged by the core
#[derive(Debug)]
struct BridgedCall {
    /// Attachment of the caller
    caller_contact: String,
    invite: SipRequest,
    /// Address the caller dialled
    dialled: String,
    media: Vec<MediaType>,
    diversions: u32,
    diverted_from: Vec<String>,
    /// Tag announced with the last 181, reused by the next leg
    next_caller_tag: Option<String>,
    forwarded_provisionals: u32,
    leg: Option<CalleeLeg>,
    /// Cancelled legs waiting for their final response
    retired: Vec<CalleeLeg>,
    final_status: Option<u16>,
    caller_bye: Option<SipRequest>,
}

impl BridgedCall {
    fn caller_call_id(&self) -> &str {
        self.invite.header(CALL_ID).unwrap_or_default()
    }

    fn has_leg(&self, leg_call_id: &str) -> bool {
        self.leg.as_ref().is_some_and(|l| l.call_id == leg_call_id)
            || self.retired.iter().any(|l| l.call_id == leg_call_id)
    }
}

/// The call router of the simulated core
#[derive(Debug)]
pub struct B2bua {
    host: String,
    max_diversions: u32,
    absorb_provisional: bool,
    calls: HashMap<String, BridgedCall>,
}

impl B2bua {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            host: config.host.clone(),
            max_diversions: config.max_diversions,
            absorb_provisional: config.absorb_provisional,
            calls: HashMap::new(),
        }
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    /// Whether `call_id` is a caller dialog we bridge
    pub fn owns_call(&self, call_id: &str) -> bool {
        self.calls.contains_key(call_id)
    }

    /// Caller Call-ID of the call `leg_call_id` belongs to
    fn call_of_leg(&self, leg_call_id: &str) -> Option<String> {
        self.calls
            .values()
            .find(|c| c.has_leg(leg_call_id))
            .map(|c| c.caller_call_id().to_string())
    }

    pub fn owns_leg(&self, call_id: &str) -> bool {
        self.call_of_leg(call_id).is_some()
    }

    /// A new INVITE from the attachment `from`
    pub fn on_invite(&mut self, from: &str, request: &SipRequest, routing: &Routing<'_>) -> Vec<Action> {
        let mut actions = vec![Action::send(
            from,
            SipResponse::for_request(request, 100, reason_phrase(100)),
        )];
        let Some(call_id) = request.header(CALL_ID).map(str::to_string) else {
            return actions;
        };
        let dialled = request.header(TO).map(addr_uri).unwrap_or(request.uri.as_str()).to_string();
        info!(%call_id, %dialled, "new call");

        let mut call = BridgedCall {
            caller_contact: from.to_string(),
            invite: request.clone(),
            dialled: dialled.clone(),
            media: sdp::offered_media(&request.body),
            diversions: 0,
            diverted_from: Vec::new(),
            next_caller_tag: None,
            forwarded_provisionals: 0,
            leg: None,
            retired: Vec::new(),
            final_status: None,
            caller_bye: None,
        };
        self.route(&mut call, &dialled, routing, &mut actions);
        // A call rejected outright stays until the caller's ACK
        self.calls.insert(call_id, call);
        actions
    }

    fn route(&self, call: &mut BridgedCall, aor: &str, routing: &Routing<'_>, actions: &mut Vec<Action>) {
        let contact = routing.registrar.contact_for(aor, routing.now).map(str::to_string);
        let mut conditions = CallConditions::new();
        if contact.is_none() {
            conditions.insert(DiversionCondition::NotRegistered);
        }
        if let Some(rules) = routing.rules(aor) {
            if let DiversionOutcome::Forward { target, rule_index } = evaluate(rules, &conditions, &call.media) {
                debug!(%aor, %target, rule_index, "diversion rule matched");
                self.divert(call, aor, &target, routing, actions);
                return;
            }
        }
        match contact {
            Some(contact) => self.fork(call, aor, &contact, actions),
            None => {
                debug!(%aor, "not registered");
                self.reject(call, 480, actions);
            }
        }
    }

    fn divert(
        &self,
        call: &mut BridgedCall,
        from_aor: &str,
        target: &str,
        routing: &Routing<'_>,
        actions: &mut Vec<Action>,
    ) {
        if call.diversions >= self.max_diversions {
            warn!(call_id = %call.caller_call_id(), "too many diversions");
            self.reject(call, 480, actions);
            return;
        }
        if !is_valid_target_uri(target) || !routing.is_routable(target) {
            info!(call_id = %call.caller_call_id(), %target, "diversion target cannot be reached");
            self.reject(call, 480, actions);
            return;
        }

        call.diversions += 1;
        call.diverted_from.push(from_aor.to_string());
        let tag = generate_tag();
        info!(call_id = %call.caller_call_id(), from = %from_aor, to = %target, "call diverted");
        if let Some(action) = self.provisional(call, 181, reason_phrase(181), &tag) {
            actions.push(action);
        }
        call.next_caller_tag = Some(tag);
        self.route(call, target, routing, actions);
    }

    fn fork(&self, call: &mut BridgedCall, aor: &str, contact: &str, actions: &mut Vec<Action>) {
        let caller_uri = call.invite.header(FROM).map(addr_uri).unwrap_or_default().to_string();
        let local_tag = generate_tag();
        let leg_call_id = generate_call_id(&self.host);

        let mut invite = core_request(&self.host, Method::Invite, contact)
            .with_header(FROM, name_addr(&caller_uri, Some(&local_tag)))
            .with_header(TO, name_addr(aor, None))
            .with_header(CALL_ID, leg_call_id.clone())
            .with_header(CSEQ, "1 INVITE");
        if !call.diverted_from.is_empty() {
            let history: Vec<String> = call
                .diverted_from
                .iter()
                .map(|d| format!("<{}>;reason=unconditional", d))
                .collect();
            invite = invite.with_header("Diversion", history.join(", "));
        }
        if !call.invite.body.is_empty() {
            let content_type = call.invite.header(CONTENT_TYPE).unwrap_or(sdp::APPLICATION_SDP);
            invite = invite.with_body(content_type, call.invite.body.clone());
        }

        debug!(call_id = %call.caller_call_id(), leg = %leg_call_id, %contact, "forking to callee");
        actions.push(Action::send(contact, invite.clone()));
        call.leg = Some(CalleeLeg {
            call_id: leg_call_id,
            contact: contact.to_string(),
            aor: aor.to_string(),
            remote_tag: None,
            invite,
            cseq: 1,
            caller_tag: call.next_caller_tag.take().unwrap_or_else(generate_tag),
            rang: false,
            ringing_timer: None,
            answered: false,
        });
    }

    /// Relay a provisional to the caller, unless only the first one of the
    /// call is forwarded and that already happened
    fn provisional(&self, call: &mut BridgedCall, status: u16, reason: &str, tag: &str) -> Option<Action> {
        if self.absorb_provisional && call.forwarded_provisionals > 0 {
            debug!(call_id = %call.caller_call_id(), status, "provisional absorbed");
            return None;
        }
        call.forwarded_provisionals += 1;
        let response = SipResponse::for_request(&call.invite, status, reason).with_to_tag(tag);
        Some(Action::send(&call.caller_contact, response))
    }

    fn reject(&self, call: &mut BridgedCall, status: u16, actions: &mut Vec<Action>) {
        let tag = call.next_caller_tag.take().unwrap_or_else(generate_tag);
        let response = SipResponse::for_request(&call.invite, status, reason_phrase(status)).with_to_tag(&tag);
        call.final_status = Some(status);
        actions.push(Action::send(&call.caller_contact, response));
    }

    /// Response from a callee on one of our legs
    pub fn on_leg_response(&mut self, response: &SipResponse, routing: &Routing<'_>) -> Vec<Action> {
        let Some(leg_call_id) = response.header(CALL_ID).map(str::to_string) else {
            return Vec::new();
        };
        let Some(caller_call_id) = self.call_of_leg(&leg_call_id) else {
            debug!(call_id = %leg_call_id, status = response.status, "response for unknown leg dropped");
            return Vec::new();
        };
        let method = response
            .header(CSEQ)
            .and_then(|v| CSeq::parse(v).ok())
            .map(|c| c.method);
        let Some(mut call) = self.calls.remove(&caller_call_id) else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        let keep = match method {
            Some(Method::Invite) => {
                self.on_invite_response(&mut call, &leg_call_id, response, routing, &mut actions);
                true
            }
            Some(Method::Bye) if response.is_final() => match call.caller_bye.take() {
                // The caller's BYE completed on the leg
                Some(bye) => {
                    actions.push(Action::send(
                        &call.caller_contact,
                        SipResponse::for_request(&bye, response.status, response.reason.clone()),
                    ));
                    info!(call_id = %caller_call_id, "call released");
                    false
                }
                None => true,
            },
            _ => true,
        };
        if keep {
            self.calls.insert(caller_call_id, call);
        }
        actions
    }

    fn on_invite_response(
        &self,
        call: &mut BridgedCall,
        leg_call_id: &str,
        response: &SipResponse,
        routing: &Routing<'_>,
        actions: &mut Vec<Action>,
    ) {
        if let Some(index) = call.retired.iter().position(|l| l.call_id == leg_call_id) {
            if response.is_final() {
                let mut leg = call.retired.remove(index);
                leg.remote_tag = response.header(TO).and_then(tag_param).map(str::to_string);
                leg.answered = response.is_success();
                actions.push(Action::send(&leg.contact, leg.request(&self.host, Method::Ack, 1)));
                if leg.answered {
                    // Answered after we gave up on it
                    leg.cseq += 1;
                    actions.push(Action::send(&leg.contact, leg.request(&self.host, Method::Bye, leg.cseq)));
                }
            }
            return;
        }

        let caller_call_id = call.caller_call_id().to_string();
        let Some(leg) = call.leg.as_mut() else {
            return;
        };
        if response.status > 100 {
            leg.remote_tag = response.header(TO).and_then(tag_param).map(str::to_string);
        }
        match response.status {
            100 => {}
            101..=199 => {
                leg.rang = true;
                let caller_tag = leg.caller_tag.clone();
                if response.status == 180 && leg.ringing_timer.is_none() {
                    if let Some(rules) = routing.rules(&leg.aor).filter(|r| r.has_no_answer_rule()) {
                        let timer = RingingTimer::started_at(routing.now, rules.no_answer_timeout());
                        leg.ringing_timer = Some(timer);
                        actions.push(Action::Schedule {
                            at: timer.deadline(),
                            timer: TimerEvent::NoAnswer {
                                call_id: caller_call_id.clone(),
                                leg: leg.call_id.clone(),
                            },
                        });
                    }
                }
                if let Some(action) = self.provisional(call, response.status, &response.reason, &caller_tag) {
                    actions.push(action);
                }
            }
            200..=299 => {
                leg.answered = true;
                let mut answer = SipResponse::for_request(&call.invite, response.status, response.reason.clone())
                    .with_to_tag(&leg.caller_tag)
                    .with_header(CONTACT, format!("<sip:{}>", self.host));
                if !response.body.is_empty() {
                    let content_type = response.header(CONTENT_TYPE).unwrap_or(sdp::APPLICATION_SDP);
                    answer = answer.with_body(content_type, response.body.clone());
                }
                info!(call_id = %caller_call_id, leg = %leg.call_id, "call answered");
                call.final_status = Some(response.status);
                actions.push(Action::send(&call.caller_contact, answer));
            }
            status => {
                let Some(leg) = call.leg.take() else {
                    return;
                };
                actions.push(Action::send(&leg.contact, leg.request(&self.host, Method::Ack, 1)));
                debug!(call_id = %caller_call_id, leg = %leg.call_id, status, "callee leg failed");

                let conditions = conditions_for_final_response(status, leg.rang);
                let outcome = routing
                    .rules(&leg.aor)
                    .map(|rules| evaluate(rules, &conditions, &call.media))
                    .unwrap_or(DiversionOutcome::NoMatch);
                match outcome {
                    DiversionOutcome::Forward { target, .. } => {
                        self.divert(call, &leg.aor, &target, routing, actions);
                    }
                    DiversionOutcome::NoMatch => {
                        call.final_status = Some(status);
                        let relayed = SipResponse::for_request(&call.invite, status, response.reason.clone())
                            .with_to_tag(&leg.caller_tag);
                        actions.push(Action::send(&call.caller_contact, relayed));
                    }
                }
            }
        }
    }

    /// Ringing on `leg_call_id` ran out
    pub fn on_no_answer(&mut self, call_id: &str, leg_call_id: &str, routing: &Routing<'_>) -> Vec<Action> {
        let Some(mut call) = self.calls.remove(call_id) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        let expired = call.leg.as_ref().and_then(|leg| {
            let timer = leg.ringing_timer?;
            (leg.call_id == leg_call_id && !leg.answered && timer.has_expired_at(routing.now)).then_some(timer)
        });

        if let (Some(timer), Some(aor)) = (expired, call.leg.as_ref().map(|l| l.aor.clone())) {
            let conditions = timer.conditions_at(&CallConditions::new(), routing.now);
            let outcome = routing
                .rules(&aor)
                .map(|rules| evaluate(rules, &conditions, &call.media))
                .unwrap_or(DiversionOutcome::NoMatch);
            if let DiversionOutcome::Forward { target, .. } = outcome {
                if let Some(leg) = call.leg.take() {
                    info!(%call_id, leg = %leg.call_id, "no answer, cancelling callee leg");
                    actions.push(Action::send(&leg.contact, leg.request(&self.host, Method::Cancel, 1)));
                    call.retired.push(leg);
                }
                self.divert(&mut call, &aor, &target, routing, &mut actions);
            }
        }
        self.calls.insert(call_id.to_string(), call);
        actions
    }

    /// Request from the caller on a bridged call
    pub fn on_caller_request(&mut self, from: &str, request: &SipRequest) -> Vec<Action> {
        let Some(call_id) = request.header(CALL_ID).map(str::to_string) else {
            return Vec::new();
        };
        let Some(mut call) = self.calls.remove(&call_id) else {
            if request.method == Method::Ack {
                return Vec::new();
            }
            return vec![Action::send(
                from,
                SipResponse::for_request(request, 481, reason_phrase(481)),
            )];
        };

        let mut actions = Vec::new();
        let keep = match request.method {
            Method::Ack => match (call.final_status, call.leg.as_ref()) {
                (Some(status), Some(leg)) if (200..300).contains(&status) && leg.answered => {
                    actions.push(Action::send(&leg.contact, leg.request(&self.host, Method::Ack, 1)));
                    true
                }
                (Some(status), _) if status >= 300 => {
                    debug!(%call_id, "failed call acknowledged");
                    false
                }
                _ => true,
            },
            Method::Bye => match call.leg.as_mut().filter(|l| l.answered) {
                Some(leg) => {
                    leg.cseq += 1;
                    actions.push(Action::send(&leg.contact, leg.request(&self.host, Method::Bye, leg.cseq)));
                    call.caller_bye = Some(request.clone());
                    true
                }
                None => {
                    actions.push(Action::send(from, SipResponse::for_request(request, 200, reason_phrase(200))));
                    false
                }
            },
            Method::Cancel => {
                actions.push(Action::send(from, SipResponse::for_request(request, 200, reason_phrase(200))));
                if call.final_status.is_none() {
                    if let Some(leg) = call.leg.take() {
                        actions.push(Action::send(&leg.contact, leg.request(&self.host, Method::Cancel, 1)));
                        call.next_caller_tag = Some(leg.caller_tag.clone());
                        call.retired.push(leg);
                    }
                    self.reject(&mut call, 487, &mut actions);
                }
                true
            }
            _ => {
                actions.push(Action::send(from, SipResponse::for_request(request, 501, "Not Implemented")));
                true
            }
        };
        if keep {
            self.calls.insert(call_id, call);
        }
        actions
    }

    /// Request from a callee on one of our legs
    pub fn on_leg_request(&mut self, from: &str, request: &SipRequest) -> Vec<Action> {
        let leg_call_id = request.header(CALL_ID).unwrap_or_default().to_string();
        let Some(caller_call_id) = self.call_of_leg(&leg_call_id) else {
            return Vec::new();
        };
        let Some(call) = self.calls.get_mut(&caller_call_id) else {
            return Vec::new();
        };
        let mut actions = vec![];
        match request.method {
            Method::Bye => {
                actions.push(Action::send(from, SipResponse::for_request(request, 200, reason_phrase(200))));
                let Some(leg) = call.leg.take() else {
                    return actions;
                };
                let caller_target = call
                    .invite
                    .header(CONTACT)
                    .map(addr_uri)
                    .unwrap_or(call.caller_contact.as_str())
                    .to_string();
                let bye = core_request(&self.host, Method::Bye, &caller_target)
                    .with_header(FROM, name_addr(&call.dialled, Some(&leg.caller_tag)))
                    .with_header(TO, call.invite.header(FROM).unwrap_or_default().to_string())
                    .with_header(CALL_ID, caller_call_id.clone())
                    .with_header(CSEQ, "1 BYE");
                info!(call_id = %caller_call_id, "callee hung up");
                actions.push(Action::send(&call.caller_contact, bye));
            }
            Method::Ack => {}
            _ => {
                actions.push(Action::send(from, SipResponse::for_request(request, 501, "Not Implemented")));
            }
        }
        actions
    }

    /// Response from the caller, i.e. to a BYE we forwarded from the callee
    pub fn on_caller_response(&mut self, response: &SipResponse) {
        let Some(call_id) = response.header(CALL_ID) else {
            return;
        };
        let is_bye = response
            .header(CSEQ)
            .and_then(|v| CSeq::parse(v).ok())
            .is_some_and(|c| c.method == Method::Bye);
        if is_bye && response.is_final() && self.calls.remove(call_id).is_some() {
            info!(%call_id, "call released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::RegisterOutcome;
    use pretty_assertions::assert_eq;
    use sipdrill_scenario_core::sip::EXPIRES;
    use sipdrill_scenario_core::{DiversionRule, SipMessage};
    use std::time::Duration;

    const CALLER: &str = "sip:6505550001@ue-caller.invalid";
    const CALLEE1: &str = "sip:6505550002@sipdrill.test";
    const CALLEE1_CONTACT: &str = "sip:6505550002@ue-callee1.invalid";
    const CALLEE2: &str = "sip:6505550003@sipdrill.test";
    const CALLEE2_CONTACT: &str = "sip:6505550003@ue-callee2.invalid";

    fn register(registrar: &mut Registrar, aor: &str, contact: &str) {
        let request = SipRequest::new(Method::Register, "sip:sipdrill.test")
            .with_header(TO, format!("<{}>", aor))
            .with_header(CONTACT, format!("<{}>", contact))
            .with_header(EXPIRES, "300");
        assert!(matches!(
            registrar.register(&request, Instant::now()),
            RegisterOutcome::Accepted { .. }
        ));
    }

    fn invite(media: &[MediaType]) -> SipRequest {
        SipRequest::new(Method::Invite, CALLEE1)
            .with_header(VIA, "SIP/2.0/SIM ue-caller.invalid;branch=z9hG4bK-1")
            .with_header(FROM, name_addr("sip:6505550001@sipdrill.test", Some("caller")))
            .with_header(TO, name_addr(CALLEE1, None))
            .with_header(CALL_ID, "call-1")
            .with_header(CSEQ, "1 INVITE")
            .with_header(CONTACT, format!("<{}>", CALLER))
            .with_body(sdp::APPLICATION_SDP, sdp::offer("ue-caller.invalid", media))
    }

    fn responses_to(actions: &[Action], to: &str) -> Vec<u16> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { to: dest, message: SipMessage::Response(r) } if dest == to => Some(r.status),
                _ => None,
            })
            .collect()
    }

    fn request_to<'a>(actions: &'a [Action], to: &str) -> Option<&'a SipRequest> {
        actions.iter().find_map(|a| match a {
            Action::Send { to: dest, message: SipMessage::Request(r) } if dest == to => Some(r),
            _ => None,
        })
    }

    fn response_to_caller(actions: &[Action]) -> SipResponse {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Send { to, message: SipMessage::Response(r) } if to == CALLER => Some(r.clone()),
                _ => None,
            })
            .unwrap()
    }

    fn answer(request: &SipRequest, status: u16, tag: &str) -> SipResponse {
        SipResponse::for_request(request, status, reason_phrase(status)).with_to_tag(tag)
    }

    #[test]
    fn test_unconditional_diversion_skips_original_callee() {
        let mut registrar = Registrar::new(&SimConfig::default());
        register(&mut registrar, CALLEE1, CALLEE1_CONTACT);
        register(&mut registrar, CALLEE2, CALLEE2_CONTACT);
        let services = HashMap::from([(
            CALLEE1.to_string(),
            DiversionRuleSet::new(vec![DiversionRule::to(CALLEE2)]),
        )]);
        let routing = Routing { registrar: &registrar, services: &services, now: Instant::now() };
        let mut b2bua = B2bua::new(&SimConfig::default());

        let actions = b2bua.on_invite(CALLER, &invite(&[MediaType::Audio]), &routing);
        assert_eq!(responses_to(&actions, CALLER), vec![100, 181]);
        assert!(request_to(&actions, CALLEE1_CONTACT).is_none());
        let leg = request_to(&actions, CALLEE2_CONTACT).unwrap();
        assert!(leg.header("Diversion").unwrap().contains(CALLEE1));
        assert_eq!(sdp::offered_media(&leg.body), vec![MediaType::Audio]);
    }

    #[test]
    fn test_busy_callee_is_diverted_with_fresh_tag() {
        let mut registrar = Registrar::new(&SimConfig::default());
        register(&mut registrar, CALLEE1, CALLEE1_CONTACT);
        register(&mut registrar, CALLEE2, CALLEE2_CONTACT);
        let services = HashMap::from([(
            CALLEE1.to_string(),
            DiversionRuleSet::new(vec![DiversionRule::to(CALLEE2).when(DiversionCondition::Busy)]),
        )]);
        let routing = Routing { registrar: &registrar, services: &services, now: Instant::now() };
        let mut b2bua = B2bua::new(&SimConfig::default());

        let actions = b2bua.on_invite(CALLER, &invite(&[MediaType::Audio]), &routing);
        let leg1 = request_to(&actions, CALLEE1_CONTACT).unwrap().clone();
        let actions = b2bua.on_leg_response(&answer(&leg1, 486, "busy"), &routing);
        assert_eq!(request_to(&actions, CALLEE1_CONTACT).map(|r| r.method.clone()), Some(Method::Ack));
        assert_eq!(responses_to(&actions, CALLER), vec![181]);
        let leg2 = request_to(&actions, CALLEE2_CONTACT).unwrap().clone();

        let ringing = response_to_caller(&b2bua.on_leg_response(&answer(&leg2, 180, "c2"), &routing));
        assert_eq!(ringing.status, 180);

        let ok = response_to_caller(&b2bua.on_leg_response(&answer(&leg2, 200, "c2"), &routing));
        assert_eq!(ok.status, 200);
        assert_eq!(ok.header(TO).and_then(tag_param), ringing.header(TO).and_then(tag_param));

        // ACK and BYE from the caller reach the answering leg
        let ack = SipRequest::new(Method::Ack, CALLEE1)
            .with_header(CALL_ID, "call-1")
            .with_header(CSEQ, "1 ACK");
        let actions = b2bua.on_caller_request(CALLER, &ack);
        assert_eq!(request_to(&actions, CALLEE2_CONTACT).map(|r| r.method.clone()), Some(Method::Ack));
        let bye = SipRequest::new(Method::Bye, CALLEE1)
            .with_header(CALL_ID, "call-1")
            .with_header(CSEQ, "2 BYE");
        let actions = b2bua.on_caller_request(CALLER, &bye);
        let forwarded = request_to(&actions, CALLEE2_CONTACT).unwrap().clone();
        assert_eq!(forwarded.header(CSEQ), Some("2 BYE"));
        let actions = b2bua.on_leg_response(&SipResponse::for_request(&forwarded, 200, "OK"), &routing);
        assert_eq!(responses_to(&actions, CALLER), vec![200]);
        assert_eq!(b2bua.active_calls(), 0);
    }

    #[test]
    fn test_leg_and_caller_dialogs_use_separate_tags() {
        let mut registrar = Registrar::new(&SimConfig::default());
        register(&mut registrar, CALLEE1, CALLEE1_CONTACT);
        let services = HashMap::new();
        let routing = Routing { registrar: &registrar, services: &services, now: Instant::now() };
        let mut b2bua = B2bua::new(&SimConfig::default());

        let actions = b2bua.on_invite(CALLER, &invite(&[MediaType::Audio]), &routing);
        let leg = request_to(&actions, CALLEE1_CONTACT).unwrap().clone();
        let leg_tag = leg.header(FROM).and_then(tag_param).unwrap().to_string();
        assert_ne!(leg_tag, "caller");

        let ringing = response_to_caller(&b2bua.on_leg_response(&answer(&leg, 180, "c1"), &routing));
        let caller_tag = ringing.header(TO).and_then(tag_param).unwrap().to_string();
        assert_ne!(caller_tag, "c1");
        assert_ne!(caller_tag, leg_tag);

        let ok = response_to_caller(&b2bua.on_leg_response(&answer(&leg, 200, "c1"), &routing));
        assert_eq!(ok.header(TO).and_then(tag_param), Some(caller_tag.as_str()));

        // In-dialog requests on the leg keep the leg's own From tag
        let ack = SipRequest::new(Method::Ack, CALLEE1)
            .with_header(CALL_ID, "call-1")
            .with_header(CSEQ, "1 ACK");
        let actions = b2bua.on_caller_request(CALLER, &ack);
        let forwarded = request_to(&actions, CALLEE1_CONTACT).unwrap();
        assert_eq!(forwarded.header(FROM).and_then(tag_param), Some(leg_tag.as_str()));
        assert_eq!(forwarded.header(TO).and_then(tag_param), Some("c1"));
    }

    #[test]
    fn test_bad_target_rejects_without_181() {
        let registrar = Registrar::new(&SimConfig::default());
        let services = HashMap::from([(
            CALLEE1.to_string(),
            DiversionRuleSet::new(vec![DiversionRule::to("12345").when(DiversionCondition::NotRegistered)]),
        )]);
        let routing = Routing { registrar: &registrar, services: &services, now: Instant::now() };
        let mut b2bua = B2bua::new(&SimConfig::default());

        let actions = b2bua.on_invite(CALLER, &invite(&[]), &routing);
        assert_eq!(responses_to(&actions, CALLER), vec![100, 480]);
        let ack = SipRequest::new(Method::Ack, CALLEE1)
            .with_header(CALL_ID, "call-1")
            .with_header(CSEQ, "1 ACK");
        assert!(b2bua.on_caller_request(CALLER, &ack).is_empty());
        assert_eq!(b2bua.active_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_answer_timer_cancels_and_diverts() {
        let mut registrar = Registrar::new(&SimConfig::default());
        register(&mut registrar, CALLEE1, CALLEE1_CONTACT);
        register(&mut registrar, CALLEE2, CALLEE2_CONTACT);
        let services = HashMap::from([(
            CALLEE1.to_string(),
            DiversionRuleSet::new(vec![DiversionRule::to(CALLEE2).when(DiversionCondition::NoAnswer)])
                .with_no_answer_timeout(5),
        )]);
        let start = Instant::now();
        let routing = Routing { registrar: &registrar, services: &services, now: start };
        let mut b2bua = B2bua::new(&SimConfig::default().with_absorb_provisional(true));

        let actions = b2bua.on_invite(CALLER, &invite(&[MediaType::Audio]), &routing);
        let leg1 = request_to(&actions, CALLEE1_CONTACT).unwrap().clone();
        let actions = b2bua.on_leg_response(&answer(&leg1, 180, "c1"), &routing);
        assert_eq!(responses_to(&actions, CALLER), vec![180]);
        let Some(Action::Schedule { at, timer: TimerEvent::NoAnswer { call_id, leg } }) =
            actions.iter().find(|a| matches!(a, Action::Schedule { .. }))
        else {
            panic!("no-answer timer not armed");
        };
        assert_eq!(*at, start + Duration::from_secs(5));

        let later = Routing { registrar: &registrar, services: &services, now: *at };
        let actions = b2bua.on_no_answer(call_id, leg, &later);
        assert_eq!(request_to(&actions, CALLEE1_CONTACT).map(|r| r.method.clone()), Some(Method::Cancel));
        // 181 absorbed: only the first provisional reaches the caller
        assert!(responses_to(&actions, CALLER).is_empty());
        assert!(request_to(&actions, CALLEE2_CONTACT).is_some());

        // The cancelled leg's 487 is acknowledged and otherwise ignored
        let actions = b2bua.on_leg_response(&answer(&leg1, 487, "c1"), &later);
        assert_eq!(request_to(&actions, CALLEE1_CONTACT).map(|r| r.method.clone()), Some(Method::Ack));
        assert!(responses_to(&actions, CALLER).is_empty());
    }
}
