//! Communication diversion (CDIV) scenarios
//!
//! Most tests share one shape: a caller dials the diverting user, whose
//! rules send the call on to a target that rings and answers. The caller
//! sees `100`, then `181 Call Is Being Forwarded`, then the target's `180`
//! (unless the device absorbs it) and `200`, then hangs up once both sides
//! have passed the ACK barrier.

use std::sync::Arc;

use sipdrill_scenario_core::sip::reason_phrase;
use sipdrill_scenario_core::{
    ensure, Barrier, Call, Capability, DiversionCondition, DiversionRule, DiversionRuleSet, Endpoint,
    EndpointOps, MediaType, Method, ScenarioResult, TestBuilder, TestDefinition,
};

/// What the caller's INVITE carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Offer {
    Audio,
    AudioVideo,
    /// No body at all
    Empty,
}

async fn send_invite(call: &mut Call, offer: Offer) -> ScenarioResult<()> {
    match offer {
        Offer::Audio => call.send_invite_with_sdp().await?,
        Offer::AudioVideo => call.send_invite_with_video_sdp().await?,
        Offer::Empty => call.send_request(Method::Invite, "", &[]).await?,
    };
    Ok(())
}

/// Take the 200, ACK it, meet the callee at `ack`, then hang up
async fn complete_answered_call(mut call: Call, ack: Arc<Barrier>) -> ScenarioResult<()> {
    call.recv_response_and_create_dialog(200).await?;
    call.update_branch();
    call.send_request(Method::Ack, "", &[]).await?;
    ack.wait().await?;

    call.update_branch();
    call.send_request(Method::Bye, "", &[]).await?;
    call.recv_response(200).await?;
    call.end_call();
    Ok(())
}

/// Caller side of a call diverted before anyone rang. `untouched`
/// endpoints must not have seen the call by the time the 181 arrives.
async fn diverted_caller(
    caller: Endpoint,
    dialled: String,
    offer: Offer,
    untouched: Vec<Endpoint>,
    ringing: Arc<Barrier>,
    ack: Arc<Barrier>,
) -> ScenarioResult<()> {
    let mut call = caller.outgoing_call(&dialled);
    send_invite(&mut call, offer).await?;
    call.recv_response(100).await?;
    call.recv_response(181).await?;
    for endpoint in &untouched {
        ensure!(
            endpoint.no_new_calls(),
            "{} received a call despite forwarding",
            endpoint.uri()
        );
    }

    call.recv_provisional(180).await?;
    ringing.wait().await?;
    complete_answered_call(call, ack).await
}

/// The diversion target: rings, answers and takes the caller's BYE.
/// `untouched` endpoints must still have no call once it is over.
async fn answering_callee(
    callee: Endpoint,
    untouched: Vec<Endpoint>,
    ringing: Arc<Barrier>,
    ack: Arc<Barrier>,
) -> ScenarioResult<()> {
    let mut call = callee.incoming_call().await?;
    call.recv_request(Method::Invite).await?;
    call.send_response(100, reason_phrase(100)).await?;
    call.send_response(180, reason_phrase(180)).await?;
    ringing.wait().await?;

    call.send_200_with_sdp().await?;
    call.recv_request(Method::Ack).await?;
    ack.wait().await?;

    call.recv_request(Method::Bye).await?;
    call.send_response(200, reason_phrase(200)).await?;
    call.end_call();

    for endpoint in &untouched {
        ensure!(
            endpoint.no_new_calls(),
            "{} received a call despite unconditional forwarding",
            endpoint.uri()
        );
    }
    Ok(())
}

/// A diverting user that turns the call down with `status`
async fn rejecting_callee(callee: Endpoint, status: u16) -> ScenarioResult<()> {
    let mut call = callee.incoming_call().await?;
    call.recv_request(Method::Invite).await?;
    call.send_response(100, reason_phrase(100)).await?;
    call.send_response(status, reason_phrase(status)).await?;
    call.recv_request(Method::Ack).await?;
    call.end_call();
    Ok(())
}

/// Provision `rules` on `diverting` and register `registered` before the
/// scenarios; unregister them afterwards
fn provision(t: &mut TestBuilder, diverting: &Endpoint, rules: DiversionRuleSet, registered: Vec<Endpoint>) {
    let diverting = diverting.clone();
    let to_register = registered.clone();
    t.add_setup(async move {
        diverting.set_diversion_rules(rules).await?;
        for endpoint in &to_register {
            endpoint.register().await?;
        }
        Ok(())
    });
    t.add_cleanup(async move {
        let mut result = Ok(());
        for endpoint in &registered {
            if let Err(e) = endpoint.unregister().await {
                result = result.and(Err(e));
            }
        }
        result
    });
}

/// The plain diverted call: `diverting` forwards to `target`, which answers
fn simple_diversion(
    t: &mut TestBuilder,
    diverting_registered: bool,
    rules: impl FnOnce(&str) -> DiversionRuleSet,
) -> ScenarioResult<Endpoint> {
    t.skip_unless(Capability::Mmtel);
    let caller = t.add_endpoint()?;
    let diverting = t.add_endpoint()?;
    let target = t.add_endpoint()?;
    let ringing = t.barrier("ringing", 2)?;
    let ack = t.barrier("ack", 2)?;

    let mut registered = vec![caller.clone(), target.clone()];
    if diverting_registered {
        registered.push(diverting.clone());
    }
    provision(t, &diverting, rules(target.uri()), registered);

    t.add_scenario(
        "caller",
        diverted_caller(
            caller,
            diverting.uri().to_string(),
            Offer::Audio,
            Vec::new(),
            ringing.clone(),
            ack.clone(),
        ),
    );
    t.add_scenario("target", answering_callee(target, Vec::new(), ringing, ack));
    Ok(diverting)
}

fn not_reachable_rules(target: &str) -> DiversionRuleSet {
    DiversionRuleSet::new(vec![
        DiversionRule::to(target).when(DiversionCondition::NotRegistered),
        DiversionRule::to(target).when(DiversionCondition::NotReachable),
    ])
}

pub fn not_registered() -> TestDefinition {
    TestDefinition::new("Call Diversion - Not registered", |t| {
        simple_diversion(t, false, |target| {
            DiversionRuleSet::new(vec![DiversionRule::to(target).when(DiversionCondition::NotRegistered)])
        })?;
        Ok(())
    })
}

pub fn not_reachable_not_registered() -> TestDefinition {
    TestDefinition::new("Call Diversion - Not reachable (not registered)", |t| {
        simple_diversion(t, false, not_reachable_rules)?;
        Ok(())
    })
}

/// The diverting user is registered but answers with `status`
pub fn not_reachable(status: u16) -> TestDefinition {
    TestDefinition::new(format!("Call Diversion - Not reachable ({})", status), move |t| {
        let diverting = simple_diversion(t, true, not_reachable_rules)?;
        t.add_scenario("diverting", rejecting_callee(diverting, status));
        Ok(())
    })
}

pub fn busy() -> TestDefinition {
    TestDefinition::new("Call Diversion - Busy", |t| {
        let diverting = simple_diversion(t, true, |target| {
            DiversionRuleSet::new(vec![DiversionRule::to(target).when(DiversionCondition::Busy)])
        })?;
        t.add_scenario("diverting", rejecting_callee(diverting, 486));
        Ok(())
    })
}

pub fn unconditional() -> TestDefinition {
    TestDefinition::new("Call Diversion - Unconditional", |t| {
        t.skip_unless(Capability::Mmtel);
        let caller = t.add_endpoint()?;
        let diverting = t.add_endpoint()?;
        let target = t.add_endpoint()?;
        let ringing = t.barrier("ringing", 2)?;
        let ack = t.barrier("ack", 2)?;

        let rules = DiversionRuleSet::new(vec![DiversionRule::to(target.uri())]);
        provision(
            t,
            &diverting,
            rules,
            vec![caller.clone(), diverting.clone(), target.clone()],
        );

        t.add_scenario(
            "caller",
            diverted_caller(
                caller,
                diverting.uri().to_string(),
                Offer::Audio,
                Vec::new(),
                ringing.clone(),
                ack.clone(),
            ),
        );
        t.add_scenario("target", answering_callee(target, vec![diverting], ringing, ack));
        Ok(())
    })
}

pub fn no_answer() -> TestDefinition {
    TestDefinition::new("Call Diversion - No answer", |t| {
        t.skip_unless(Capability::Mmtel);
        let caller = t.add_endpoint()?;
        let diverting = t.add_endpoint()?;
        let target = t.add_endpoint()?;
        let first_ringing = t.barrier("ringing", 2)?;
        let target_ringing = t.barrier("ringing 2", 2)?;
        let ack = t.barrier("ack", 2)?;

        let rules = DiversionRuleSet::new(vec![
            DiversionRule::to(target.uri()).when(DiversionCondition::NoAnswer)
        ])
        .with_no_answer_timeout(20);
        provision(
            t,
            &diverting,
            rules,
            vec![caller.clone(), diverting.clone(), target.clone()],
        );

        let dialled = diverting.uri().to_string();
        let (caller_ringing, caller_target_ringing, caller_ack) =
            (first_ringing.clone(), target_ringing.clone(), ack.clone());
        t.add_scenario("caller", async move {
            let mut call = caller.outgoing_call(&dialled);
            call.send_invite_with_sdp().await?;
            call.recv_response(100).await?;
            call.recv_response(180).await?;

            // no-answer only holds once ringing has started
            caller_ringing.wait().await?;
            call.recv_provisional(181).await?;
            call.recv_provisional(180).await?;
            caller_target_ringing.wait().await?;
            complete_answered_call(call, caller_ack).await
        });

        t.add_scenario("diverting", async move {
            let mut call = diverting.incoming_call().await?;
            call.recv_request(Method::Invite).await?;
            call.send_response(100, reason_phrase(100)).await?;
            call.send_response(180, reason_phrase(180)).await?;
            first_ringing.wait().await?;

            call.send_response(408, reason_phrase(408)).await?;
            call.recv_request(Method::Ack).await?;
            call.end_call();
            Ok(())
        });

        t.add_scenario("target", answering_callee(target, Vec::new(), target_ringing, ack));
        Ok(())
    })
}

pub fn bad_target_uri() -> TestDefinition {
    TestDefinition::new("Call Diversion - Bad target URI", |t| {
        t.skip_unless(Capability::Mmtel);
        let caller = t.add_endpoint()?;
        let diverting = t.add_endpoint()?;

        let rules = DiversionRuleSet::new(vec![
            DiversionRule::to("12345").when(DiversionCondition::NotRegistered)
        ]);
        provision(t, &diverting, rules, vec![caller.clone()]);

        let dialled = diverting.uri().to_string();
        t.add_scenario("caller", async move {
            let mut call = caller.outgoing_call(&dialled);
            send_invite(&mut call, Offer::Empty).await?;
            call.recv_response(100).await?;
            call.recv_response(480).await?;
            call.send_request(Method::Ack, "", &[]).await?;
            call.end_call();
            Ok(())
        });
        Ok(())
    })
}

/// Rules preferring `video_target` for audio+video calls and
/// `audio_target` for anything with audio
fn media_rules(video_target: &str, audio_target: &str) -> DiversionRuleSet {
    DiversionRuleSet::new(vec![
        DiversionRule::to(video_target).with_media(&[MediaType::Audio, MediaType::Video]),
        DiversionRule::to(audio_target).with_media(&[MediaType::Audio]),
    ])
}

fn media_diversion(t: &mut TestBuilder, offer: Offer) -> ScenarioResult<()> {
    t.skip_unless(Capability::Mmtel);
    let caller = t.add_endpoint()?;
    let diverting = t.add_endpoint()?;
    let video_target = t.add_endpoint()?;
    let audio_target = t.add_endpoint()?;
    let ringing = t.barrier("ringing", 2)?;
    let ack = t.barrier("ack", 2)?;

    let rules = media_rules(video_target.uri(), audio_target.uri());
    provision(
        t,
        &diverting,
        rules,
        vec![
            caller.clone(),
            diverting.clone(),
            video_target.clone(),
            audio_target.clone(),
        ],
    );

    let (answering, passed_over) = match offer {
        Offer::AudioVideo => (video_target, audio_target),
        _ => (audio_target, video_target),
    };
    t.add_scenario(
        "caller",
        diverted_caller(
            caller,
            diverting.uri().to_string(),
            offer,
            vec![diverting, passed_over],
            ringing.clone(),
            ack.clone(),
        ),
    );
    t.add_scenario("target", answering_callee(answering, Vec::new(), ringing, ack));
    Ok(())
}

pub fn audio_only() -> TestDefinition {
    TestDefinition::new("Call Diversion - Audio-only call", |t| media_diversion(t, Offer::Audio))
}

pub fn audio_video() -> TestDefinition {
    TestDefinition::new("Call Diversion - Audio-video call", |t| {
        media_diversion(t, Offer::AudioVideo)
    })
}

/// Every call-diversion test, in the order they are run
pub fn definitions() -> Vec<TestDefinition> {
    vec![
        not_registered(),
        not_reachable_not_registered(),
        not_reachable(408),
        not_reachable(503),
        not_reachable(500),
        busy(),
        unconditional(),
        no_answer(),
        bad_target_uri(),
        audio_only(),
        audio_video(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let definitions = definitions();
        let mut names: Vec<&str> = definitions.iter().map(|t| t.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), definitions.len());
    }

    #[test]
    fn test_media_rules_prefer_video_target() {
        let rules = media_rules("sip:video@sipdrill.test", "sip:audio@sipdrill.test");
        let none = Default::default();
        let pick = |offered: &[MediaType]| {
            sipdrill_scenario_core::evaluate(&rules, &none, offered)
                .target()
                .map(str::to_string)
        };
        assert_eq!(
            pick(&[MediaType::Audio, MediaType::Video]).as_deref(),
            Some("sip:video@sipdrill.test")
        );
        assert_eq!(pick(&[MediaType::Audio]).as_deref(), Some("sip:audio@sipdrill.test"));
        assert_eq!(pick(&[]), None);
    }
}
