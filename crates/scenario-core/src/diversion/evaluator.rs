//! First-match evaluation of diversion rules
//!
//! Evaluation is a pure function of the rule set, the conditions holding for
//! the call and the media it offers. Time enters only through
//! [`RingingTimer`], which decides whether `no-answer` holds at the instant
//! of evaluation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::rules::{CallConditions, DiversionCondition, DiversionRuleSet};
use crate::sip::MediaType;

/// Result of evaluating a rule set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiversionOutcome {
    /// Forward to `target`, chosen by the rule at `rule_index`
    Forward { target: String, rule_index: usize },
    NoMatch,
}

impl DiversionOutcome {
    pub fn target(&self) -> Option<&str> {
        match self {
            DiversionOutcome::Forward { target, .. } => Some(target),
            DiversionOutcome::NoMatch => None,
        }
    }
}

/// Pick the first rule of an active set whose conditions all hold and whose
/// media conditions are all offered.
///
/// Targets are returned as configured; a malformed target still matches and
/// is expected to fail when the call is routed.
pub fn evaluate(
    rule_set: &DiversionRuleSet,
    conditions: &CallConditions,
    offered_media: &[MediaType],
) -> DiversionOutcome {
    if !rule_set.active {
        return DiversionOutcome::NoMatch;
    }
    rule_set
        .rules
        .iter()
        .position(|rule| rule.matches(conditions, offered_media))
        .map(|rule_index| DiversionOutcome::Forward {
            target: rule_set.rules[rule_index].target.clone(),
            rule_index,
        })
        .unwrap_or(DiversionOutcome::NoMatch)
}

/// Tracks how long the diverting user has been ringing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingingTimer {
    started: Instant,
    timeout: Duration,
}

impl RingingTimer {
    pub fn start(timeout: Duration) -> Self {
        Self::started_at(Instant::now(), timeout)
    }

    pub fn started_at(started: Instant, timeout: Duration) -> Self {
        Self { started, timeout }
    }

    /// Instant at which `no-answer` starts to hold
    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    pub fn has_expired_at(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// `base` plus `no-answer` if the timeout has elapsed by `now`
    pub fn conditions_at(&self, base: &CallConditions, now: Instant) -> CallConditions {
        let mut conditions = base.clone();
        if self.has_expired_at(now) {
            conditions.insert(DiversionCondition::NoAnswer);
        }
        conditions
    }

    pub fn conditions(&self, base: &CallConditions) -> CallConditions {
        self.conditions_at(base, Instant::now())
    }
}

/// Conditions implied by the diverting user's final response.
///
/// 486/600 mean busy; 408, 480, 500, 503 and 504 mean the user could not be
/// reached. A 408 after ringing started is also how an unanswered call ends,
/// so it additionally implies `no-answer`.
pub fn conditions_for_final_response(status: u16, was_ringing: bool) -> CallConditions {
    let mut conditions = CallConditions::new();
    match status {
        486 | 600 => {
            conditions.insert(DiversionCondition::Busy);
        }
        408 | 480 | 500 | 503 | 504 => {
            conditions.insert(DiversionCondition::NotReachable);
            if status == 408 && was_ringing {
                conditions.insert(DiversionCondition::NoAnswer);
            }
        }
        _ => {}
    }
    conditions
}

/// Whether `uri` is something a call can be routed to (`sip:`, `sips:` or
/// `tel:` with a non-empty remainder)
pub fn is_valid_target_uri(uri: &str) -> bool {
    let uri = uri.trim();
    let Some((scheme, rest)) = uri.split_once(':') else {
        return false;
    };
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return false;
    }
    match scheme.to_ascii_lowercase().as_str() {
        "sip" | "sips" => {
            let host = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
            !host.is_empty() && !host.starts_with(';')
        }
        "tel" => rest
            .trim_start_matches('+')
            .split(';')
            .next()
            .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit() || c == '-')),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diversion::rules::DiversionRule;

    fn media_rules() -> DiversionRuleSet {
        DiversionRuleSet::new(vec![
            DiversionRule::to("sip:callee2@x").with_media(&[MediaType::Audio, MediaType::Video]),
            DiversionRule::to("sip:callee3@x").with_media(&[MediaType::Audio]),
        ])
    }

    #[test]
    fn test_inactive_set_never_matches() {
        let set = DiversionRuleSet::new(vec![DiversionRule::to("sip:b@x")]).inactive();
        assert_eq!(evaluate(&set, &CallConditions::new(), &[]), DiversionOutcome::NoMatch);
    }

    #[test]
    fn test_media_conditions_pick_first_match() {
        let set = media_rules();
        let audio_only = evaluate(&set, &CallConditions::new(), &[MediaType::Audio]);
        assert_eq!(
            audio_only,
            DiversionOutcome::Forward { target: "sip:callee3@x".into(), rule_index: 1 }
        );
        let audio_video =
            evaluate(&set, &CallConditions::new(), &[MediaType::Audio, MediaType::Video]);
        assert_eq!(audio_video.target(), Some("sip:callee2@x"));
        assert_eq!(evaluate(&set, &CallConditions::new(), &[MediaType::Video]), DiversionOutcome::NoMatch);
    }

    #[test]
    fn test_malformed_target_still_matches() {
        let set = DiversionRuleSet::new(vec![
            DiversionRule::to("12345").when(DiversionCondition::NotRegistered),
        ]);
        let conditions: CallConditions = [DiversionCondition::NotRegistered].into();
        assert_eq!(evaluate(&set, &conditions, &[]).target(), Some("12345"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_answer_holds_only_after_timeout() {
        let set = DiversionRuleSet::new(vec![
            DiversionRule::to("sip:b@x").when(DiversionCondition::NoAnswer),
        ])
        .with_no_answer_timeout(20);
        let timer = RingingTimer::start(set.no_answer_timeout());
        let base = CallConditions::new();

        assert_eq!(evaluate(&set, &timer.conditions(&base), &[]), DiversionOutcome::NoMatch);
        tokio::time::advance(Duration::from_secs(19)).await;
        assert_eq!(evaluate(&set, &timer.conditions(&base), &[]), DiversionOutcome::NoMatch);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(evaluate(&set, &timer.conditions(&base), &[]).target(), Some("sip:b@x"));
    }

    #[test]
    fn test_final_response_conditions() {
        use DiversionCondition::*;
        assert_eq!(conditions_for_final_response(486, false), CallConditions::from([Busy]));
        assert_eq!(conditions_for_final_response(600, true), CallConditions::from([Busy]));
        assert_eq!(conditions_for_final_response(503, false), CallConditions::from([NotReachable]));
        assert_eq!(conditions_for_final_response(408, false), CallConditions::from([NotReachable]));
        assert_eq!(conditions_for_final_response(408, true), CallConditions::from([NotReachable, NoAnswer]));
        assert!(conditions_for_final_response(404, false).is_empty());
    }

    #[test]
    fn test_target_uri_syntax() {
        assert!(is_valid_target_uri("sip:6505550002@example.com"));
        assert!(is_valid_target_uri("sips:bob@example.com;transport=tls"));
        assert!(is_valid_target_uri("tel:+1-650-555-0002"));
        assert!(!is_valid_target_uri("12345"));
        assert!(!is_valid_target_uri("sip:"));
        assert!(!is_valid_target_uri("http://example.com"));
        assert!(!is_valid_target_uri("tel:abc"));
    }
}
