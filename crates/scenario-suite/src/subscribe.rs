//! `reg` event package scenarios
//!
//! An endpoint subscribes to an address-of-record's registration state and
//! checks the NOTIFYs it receives: CSeq strictly increasing, nothing after
//! the terminating NOTIFY, the expected Subscription-State, and bodies that
//! pass the reginfo (and gruuinfo) validators.

use std::time::Duration;

use sipdrill_scenario_core::sip::{
    reason_phrase, CSeq, CSEQ, EVENT, EXPIRES, FROM, SUBSCRIPTION_STATE, TO,
};
use sipdrill_scenario_core::subscription::{
    ContactEvent, GruuInfoValidator, RegInfo, RegInfoValidator, REG_EVENT,
};
use sipdrill_scenario_core::{
    ensure, Call, Capability, EndpointOps, Method, NotifySequence, ScenarioError, ScenarioResult,
    SipRequest, SubscriptionState, SubscriptionStateHeader, TerminationReason, TestDefinition,
    ValidationCollector,
};
use tracing::debug;

/// Stand-in for a computed digest `response`; the registrar only has to see
/// that credentials were offered
const UNCOMPUTED_RESPONSE: &str = "00000000000000000000000000000000";

fn header<'a>(request: &'a SipRequest, name: &str) -> ScenarioResult<&'a str> {
    request
        .header(name)
        .ok_or_else(|| ScenarioError::protocol(format!("{} without {} header", request.method, name)))
}

fn subscription_state(notify: &SipRequest) -> ScenarioResult<SubscriptionStateHeader> {
    header(notify, SUBSCRIPTION_STATE)?.parse()
}

fn cseq(request: &SipRequest) -> ScenarioResult<u32> {
    Ok(CSeq::parse(header(request, CSEQ)?)?.number)
}

/// The NOTIFY after `first` must carry the very next CSeq
fn ensure_next_cseq(first: &SipRequest, next: &SipRequest) -> ScenarioResult<()> {
    let (first, next) = (cseq(first)?, cseq(next)?);
    ensure!(
        next == first + 1,
        "NOTIFY CSeq went from {} to {}, expected {}",
        first,
        next,
        first + 1
    );
    Ok(())
}

/// Answer a NOTIFY just received on `call`
async fn ack_notify(call: &mut Call) -> ScenarioResult<()> {
    call.send_response(200, reason_phrase(200)).await?;
    Ok(())
}

/// End the subscription on `call` with `Expires: 0`, addressing it from the
/// identities of an earlier NOTIFY. Returns the terminating NOTIFY.
async fn unsubscribe(call: &mut Call, earlier: &SipRequest) -> ScenarioResult<SipRequest> {
    let from = header(earlier, TO)?.to_string();
    let to = header(earlier, FROM)?.to_string();
    call.update_branch();
    call.send_request(
        Method::Subscribe,
        "",
        &[(EVENT, REG_EVENT), (FROM, &from), (TO, &to), (EXPIRES, "0")],
    )
    .await?;
    let notify = call.recv_200_and_notify().await?;
    ack_notify(call).await?;

    let state = subscription_state(&notify)?;
    ensure!(
        state == SubscriptionStateHeader::terminated(TerminationReason::Timeout),
        "final Subscription-State is '{}', not 'terminated;reason=timeout'",
        state
    );
    Ok(notify)
}

fn validate_all(validator: &ValidationCollector, notifies: &[(&str, &SipRequest)]) {
    for (label, notify) in notifies {
        validator.check(label, &RegInfoValidator, &notify.body);
    }
}

pub fn reg_event() -> TestDefinition {
    TestDefinition::new("SUBSCRIBE - reg-event", |t| {
        let ep1 = t.add_endpoint()?;
        let validator = t.validator();

        let registering = ep1.clone();
        t.add_setup(async move { registering.register().await });

        let subscriber = ep1.clone();
        t.add_scenario("subscriber", async move {
            let mut sequence = NotifySequence::new();
            let mut call = subscriber.outgoing_call(subscriber.uri());
            call.send_request(Method::Subscribe, "", &[(EVENT, REG_EVENT)]).await?;
            let notify1 = call.recv_200_and_notify().await?;
            ack_notify(&mut call).await?;
            sequence.observe(&notify1)?;

            // A re-registration within the same second may not be notified
            tokio::time::sleep(Duration::from_secs(1)).await;
            subscriber.register().await?;
            let notify2 = call.recv_request(Method::Notify).await?;
            ack_notify(&mut call).await?;
            sequence.observe(&notify2)?;

            let notify3 = unsubscribe(&mut call, &notify1).await?;
            sequence.observe(&notify3)?;

            subscriber.register().await?;
            call.end_call();

            ensure!(sequence.is_terminated(), "subscription not terminated after unsubscribe");
            validate_all(
                &validator,
                &[("notify1", &notify1), ("notify2", &notify2), ("notify3", &notify3)],
            );
            Ok(())
        });

        t.add_cleanup(async move { ep1.unregister().await });
        Ok(())
    })
}

pub fn reg_event_with_gruu() -> TestDefinition {
    TestDefinition::new("SUBSCRIBE - reg-event with a GRUU", |t| {
        let ep1 = t.add_endpoint()?;
        let validator = t.validator();

        let registering = ep1.clone();
        t.add_setup(async move { registering.register().await });

        let subscriber = ep1.clone();
        t.add_scenario("subscriber", async move {
            let mut call = subscriber.outgoing_call(subscriber.uri());
            call.send_request(Method::Subscribe, "", &[(EVENT, REG_EVENT)]).await?;
            let notify = call.recv_200_and_notify().await?;
            ack_notify(&mut call).await?;
            validator.check("notify", &RegInfoValidator, &notify.body);

            let reginfo = RegInfo::parse(&notify.body)?;
            let expected = subscriber.expected_pub_gruu();
            let contacts: Vec<_> = reginfo
                .registration(subscriber.uri())
                .map(|r| r.contacts.iter().filter(|c| c.pub_gruu.is_some()).collect())
                .unwrap_or_default();
            ensure!(
                contacts.len() == 1,
                "binding does not have exactly one pub-gruu in body:\n{}",
                notify.body
            );
            let contact = contacts[0];
            ensure!(
                contact.pub_gruu.as_deref() == Some(expected.as_str()),
                "incorrect pub-gruu (expected {}):\n{}",
                expected,
                notify.body
            );
            if let Some(fragment) = contact.pub_gruu_fragment()? {
                validator.check("pub-gruu", &GruuInfoValidator, &fragment);
            }
            call.end_call();
            Ok(())
        });

        t.add_cleanup(async move { ep1.unregister().await });
        Ok(())
    })
}

pub fn subscription_timeout() -> TestDefinition {
    TestDefinition::new("SUBSCRIBE - Subscription timeout", |t| {
        let ep1 = t.add_endpoint()?;
        let validator = t.validator();

        let registering = ep1.clone();
        t.add_setup(async move { registering.register().await });

        let subscriber = ep1.clone();
        t.add_scenario("subscriber", async move {
            let mut sequence = NotifySequence::new();
            let mut call = subscriber.outgoing_call(subscriber.uri());
            call.send_request(Method::Subscribe, "", &[(EVENT, REG_EVENT), (EXPIRES, "3")])
                .await?;
            let notify1 = call.recv_200_and_notify().await?;
            ack_notify(&mut call).await?;
            let state1 = sequence.observe(&notify1)?;

            // Sleep until the subscription has nearly expired, then expect
            // the notifier to end it
            tokio::time::sleep(Duration::from_millis(2500)).await;
            let notify2 = call.recv_request(Method::Notify).await?;
            ack_notify(&mut call).await?;
            let state2 = sequence.observe(&notify2)?;
            call.end_call();
            ensure_next_cseq(&notify1, &notify2)?;

            validate_all(&validator, &[("notify1", &notify1), ("notify2", &notify2)]);

            // Allow for the expiry having ticked down by a second
            ensure!(
                state1.state == SubscriptionState::Active && matches!(state1.expires, Some(2..=3)),
                "first Subscription-State is '{}', not active;expires=2 or 3",
                state1
            );
            ensure!(
                state2 == SubscriptionStateHeader::terminated(TerminationReason::Timeout),
                "final Subscription-State is '{}', not 'terminated;reason=timeout'",
                state2
            );
            Ok(())
        });

        t.add_cleanup(async move { ep1.unregister().await });
        Ok(())
    })
}

/// Extract a `name="value"` parameter from a digest challenge
fn digest_param<'a>(challenge: &'a str, name: &str) -> Option<&'a str> {
    challenge
        .trim_start_matches("Digest")
        .split(',')
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim().trim_matches('"'))
}

pub fn registration_timeout() -> TestDefinition {
    TestDefinition::new("SUBSCRIBE - Registration timeout", |t| {
        // REGISTERs with Expires: 3, which the registrar may refuse
        t.skip_unless(Capability::ShortRegistration);

        let ep1 = t.add_endpoint()?;
        let ep2 = t.add_public_identity(&ep1)?;
        let validator = t.validator();

        let registering = ep2.clone();
        t.add_setup(async move { registering.register().await });

        let (registrant, subscriber) = (ep1.clone(), ep2.clone());
        t.add_scenario("subscriber", async move {
            let registrar = format!("sip:{}", registrant.config().home_domain);
            let to = format!("<{}>", registrant.uri());
            let mut call = registrant.outgoing_call(&registrar);

            let username = format!("Digest username=\"{}\"", registrant.private_id());
            call.send_request(
                Method::Register,
                "",
                &[(TO, &to), (EXPIRES, "3"), ("Authorization", &username)],
            )
            .await?;
            let challenge = call.recv_response(401).await?;
            let www_authenticate = challenge
                .header("WWW-Authenticate")
                .ok_or_else(|| ScenarioError::protocol("401 without WWW-Authenticate"))?;
            let authorization = format!(
                "{}, realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                username,
                digest_param(www_authenticate, "realm").unwrap_or_default(),
                digest_param(www_authenticate, "nonce").unwrap_or_default(),
                registrar,
                UNCOMPUTED_RESPONSE
            );
            call.update_branch();
            call.send_request(
                Method::Register,
                "",
                &[(TO, &to), (EXPIRES, "3"), ("Authorization", &authorization)],
            )
            .await?;
            call.recv_response(200).await?;

            let mut sequence = NotifySequence::new();
            let mut sub = subscriber.outgoing_call(registrant.uri());
            sub.send_request(Method::Subscribe, "", &[(EVENT, REG_EVENT)]).await?;
            let notify1 = sub.recv_200_and_notify().await?;
            ack_notify(&mut sub).await?;
            sequence.observe(&notify1)?;

            // ep1's registration expires a few seconds later
            let notify2 = sub.recv_request(Method::Notify).await?;
            ack_notify(&mut sub).await?;
            sequence.observe(&notify2)?;
            ensure_next_cseq(&notify1, &notify2)?;

            sub.end_call();
            call.end_call();

            validate_all(&validator, &[("notify1", &notify1), ("notify2", &notify2)]);
            let reginfo = RegInfo::parse(&notify2.body)?;
            let event = reginfo.contacts().next().map(|c| c.event);
            ensure!(
                event == Some(ContactEvent::Expired),
                "NOTIFY does not indicate the registration expired (first contact event {:?})",
                event
            );
            Ok(())
        });

        t.add_cleanup(async move {
            let result = ep2.unregister().await;
            // The registration should have timed out already; failing to
            // remove it is not an error
            if let Err(e) = ep1.unregister().await {
                debug!(uri = %ep1.uri(), error = %e, "speculative unregister failed");
            }
            result
        });
        Ok(())
    })
}

pub fn multiple_subscribers() -> TestDefinition {
    TestDefinition::new("Multiple SUBSCRIBErs to one UE's reg-event", |t| {
        let ep1 = t.add_endpoint()?;
        let ep2 = t.add_public_identity(&ep1)?;
        let validator = t.validator();

        let (reg1, reg2) = (ep1.clone(), ep2.clone());
        t.add_setup(async move {
            reg1.register().await?;
            reg2.register().await
        });

        let (first, second) = (ep1.clone(), ep2.clone());
        t.add_scenario("subscribers", async move {
            let (mut sequence1, mut sequence2) = (NotifySequence::new(), NotifySequence::new());

            let mut call = first.outgoing_call(first.uri());
            call.send_request(Method::Subscribe, "", &[(EVENT, REG_EVENT)]).await?;
            let notify1 = call.recv_200_and_notify().await?;
            ack_notify(&mut call).await?;
            sequence1.observe(&notify1)?;

            // The second identity watches the first one's registrations
            let mut call2 = second.outgoing_call(first.uri());
            call2.send_request(Method::Subscribe, "", &[(EVENT, REG_EVENT)]).await?;
            let notify2 = call2.recv_200_and_notify().await?;
            ack_notify(&mut call2).await?;
            sequence2.observe(&notify2)?;

            tokio::time::sleep(Duration::from_secs(1)).await;
            first.register().await?;
            let notify3 = call.recv_request(Method::Notify).await?;
            ack_notify(&mut call).await?;
            sequence1.observe(&notify3)?;
            let notify4 = call2.recv_request(Method::Notify).await?;
            ack_notify(&mut call2).await?;
            sequence2.observe(&notify4)?;

            let notify5 = unsubscribe(&mut call2, &notify2).await?;
            sequence2.observe(&notify5)?;
            let notify6 = unsubscribe(&mut call, &notify1).await?;
            sequence1.observe(&notify6)?;

            call.end_call();
            call2.end_call();

            validate_all(
                &validator,
                &[
                    ("notify1", &notify1),
                    ("notify2", &notify2),
                    ("notify3", &notify3),
                    ("notify4", &notify4),
                    ("notify5", &notify5),
                    ("notify6", &notify6),
                ],
            );
            Ok(())
        });

        t.add_cleanup(async move {
            let result = ep1.unregister().await;
            result.and(ep2.unregister().await)
        });
        Ok(())
    })
}

/// Every reg-event test, in the order they are run
pub fn definitions() -> Vec<TestDefinition> {
    vec![
        reg_event(),
        reg_event_with_gruu(),
        subscription_timeout(),
        registration_timeout(),
        multiple_subscribers(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_param() {
        let challenge = "Digest realm=\"sipdrill.test\", nonce=\"abc123\", algorithm=MD5, qop=\"auth\"";
        assert_eq!(digest_param(challenge, "realm"), Some("sipdrill.test"));
        assert_eq!(digest_param(challenge, "nonce"), Some("abc123"));
        assert_eq!(digest_param(challenge, "algorithm"), Some("MD5"));
        assert_eq!(digest_param(challenge, "opaque"), None);
    }

    fn notify(cseq: u32) -> SipRequest {
        SipRequest::new(Method::Notify, "sip:ep1@sipdrill.test").with_header(CSEQ, format!("{} NOTIFY", cseq))
    }

    #[test]
    fn test_next_cseq_must_follow_directly() {
        assert!(ensure_next_cseq(&notify(7), &notify(8)).is_ok());
        let err = ensure_next_cseq(&notify(7), &notify(9)).unwrap_err();
        assert!(err.to_string().contains("from 7 to 9"), "{}", err);
        assert!(ensure_next_cseq(&notify(7), &SipRequest::new(Method::Notify, "sip:x")).is_err());
    }
}
