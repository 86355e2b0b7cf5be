//! Communication-diversion rule model

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ScenarioError;
use crate::sip::MediaType;

/// Outcome of the attempt to reach the diverting user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiversionCondition {
    NotRegistered,
    NotReachable,
    Busy,
    NoAnswer,
}

impl DiversionCondition {
    pub const ALL: [DiversionCondition; 4] = [
        DiversionCondition::NotRegistered,
        DiversionCondition::NotReachable,
        DiversionCondition::Busy,
        DiversionCondition::NoAnswer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiversionCondition::NotRegistered => "not-registered",
            DiversionCondition::NotReachable => "not-reachable",
            DiversionCondition::Busy => "busy",
            DiversionCondition::NoAnswer => "no-answer",
        }
    }
}

impl fmt::Display for DiversionCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiversionCondition {
    type Err = ScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ScenarioError::config(format!("unknown diversion condition '{}'", s)))
    }
}

/// Set of conditions that hold for a call at evaluation time
pub type CallConditions = BTreeSet<DiversionCondition>;

/// One forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiversionRule {
    /// All of these must hold; empty means unconditional
    #[serde(default)]
    pub conditions: BTreeSet<DiversionCondition>,
    /// All of these must be offered; empty means any media
    #[serde(default)]
    pub media_conditions: Vec<MediaType>,
    /// Where to forward. Not validated here.
    pub target: String,
}

impl DiversionRule {
    /// An unconditional rule forwarding to `target`
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            conditions: BTreeSet::new(),
            media_conditions: Vec::new(),
            target: target.into(),
        }
    }

    pub fn when(mut self, condition: DiversionCondition) -> Self {
        self.conditions.insert(condition);
        self
    }

    pub fn with_media(mut self, media: &[MediaType]) -> Self {
        for m in media {
            if !self.media_conditions.contains(m) {
                self.media_conditions.push(*m);
            }
        }
        self
    }

    /// Whether this rule applies to a call with `conditions` offering `offered`
    pub fn matches(&self, conditions: &CallConditions, offered: &[MediaType]) -> bool {
        self.conditions.is_subset(conditions)
            && self.media_conditions.iter().all(|m| offered.contains(m))
    }
}

fn default_no_answer_timeout() -> u32 {
    20
}

/// A user's communication-diversion service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiversionRuleSet {
    pub active: bool,
    /// Seconds of ringing before `no-answer` holds
    #[serde(default = "default_no_answer_timeout")]
    pub no_answer_timeout_secs: u32,
    #[serde(default)]
    pub rules: Vec<DiversionRule>,
}

impl Default for DiversionRuleSet {
    fn default() -> Self {
        Self {
            active: false,
            no_answer_timeout_secs: default_no_answer_timeout(),
            rules: Vec::new(),
        }
    }
}

impl DiversionRuleSet {
    /// An active rule set with the default no-answer timeout
    pub fn new(rules: Vec<DiversionRule>) -> Self {
        Self {
            active: true,
            rules,
            ..Default::default()
        }
    }

    pub fn with_no_answer_timeout(mut self, secs: u32) -> Self {
        self.no_answer_timeout_secs = secs;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn no_answer_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.no_answer_timeout_secs))
    }

    /// Whether any rule could fire once ringing has timed out
    pub fn has_no_answer_rule(&self) -> bool {
        self.active
            && self
                .rules
                .iter()
                .any(|r| r.conditions.contains(&DiversionCondition::NoAnswer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_names() {
        for condition in DiversionCondition::ALL {
            assert_eq!(condition.as_str().parse::<DiversionCondition>().unwrap(), condition);
        }
        assert!("unreachable".parse::<DiversionCondition>().is_err());
        assert_eq!(
            serde_json::to_string(&DiversionCondition::NotRegistered).unwrap(),
            "\"not-registered\""
        );
    }

    #[test]
    fn test_rule_matching() {
        let rule = DiversionRule::to("sip:b@x")
            .when(DiversionCondition::Busy)
            .with_media(&[MediaType::Audio, MediaType::Video]);
        let busy: CallConditions = [DiversionCondition::Busy].into();
        assert!(rule.matches(&busy, &[MediaType::Video, MediaType::Audio]));
        assert!(!rule.matches(&busy, &[MediaType::Audio]));
        assert!(!rule.matches(&CallConditions::new(), &[MediaType::Audio, MediaType::Video]));

        let unconditional = DiversionRule::to("sip:c@x");
        assert!(unconditional.matches(&CallConditions::new(), &[]));
    }

    #[test]
    fn test_rule_set_deserializes_with_defaults() {
        let set: DiversionRuleSet = serde_json::from_str(
            r#"{"active": true, "rules": [{"conditions": ["no-answer"], "target": "sip:b@x"}]}"#,
        )
        .unwrap();
        assert_eq!(set.no_answer_timeout(), Duration::from_secs(20));
        assert!(set.has_no_answer_rule());
        assert!(set.rules[0].media_conditions.is_empty());
    }
}
