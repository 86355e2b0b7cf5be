//! Subscription states and the `Subscription-State` header (RFC 6665 §8.2.3)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ScenarioError;
use crate::sip::header_param;

/// Lifecycle state of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Pending,
    Active,
    Terminated,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Pending => "pending",
            SubscriptionState::Active => "active",
            SubscriptionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a subscription ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationReason {
    /// Expired, or removed by a SUBSCRIBE with `Expires: 0`
    Timeout,
    /// Ended by the notifier
    Deactivated,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Timeout => "timeout",
            TerminationReason::Deactivated => "deactivated",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `Subscription-State` header value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStateHeader {
    pub state: SubscriptionState,
    pub expires: Option<u32>,
    pub reason: Option<TerminationReason>,
}

impl SubscriptionStateHeader {
    pub fn active(expires: u32) -> Self {
        Self {
            state: SubscriptionState::Active,
            expires: Some(expires),
            reason: None,
        }
    }

    pub fn terminated(reason: TerminationReason) -> Self {
        Self {
            state: SubscriptionState::Terminated,
            expires: None,
            reason: Some(reason),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SubscriptionState::Terminated
    }
}

impl fmt::Display for SubscriptionStateHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        if let Some(reason) = self.reason {
            write!(f, ";reason={}", reason)?;
        }
        if let Some(expires) = self.expires {
            write!(f, ";expires={}", expires)?;
        }
        Ok(())
    }
}

impl FromStr for SubscriptionStateHeader {
    type Err = ScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        let state = match value.split(';').next().map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("active") => SubscriptionState::Active,
            Some(v) if v.eq_ignore_ascii_case("pending") => SubscriptionState::Pending,
            Some(v) if v.eq_ignore_ascii_case("terminated") => SubscriptionState::Terminated,
            _ => {
                return Err(ScenarioError::protocol(format!(
                    "unknown Subscription-State '{}'",
                    value
                )))
            }
        };

        let expires = header_param(value, "expires")
            .map(|e| {
                e.parse::<u32>().map_err(|_| {
                    ScenarioError::protocol(format!("bad expires in Subscription-State '{}'", value))
                })
            })
            .transpose()?;

        let reason = match header_param(value, "reason") {
            None => None,
            Some(r) if r.eq_ignore_ascii_case("timeout") => Some(TerminationReason::Timeout),
            Some(r) if r.eq_ignore_ascii_case("deactivated") => Some(TerminationReason::Deactivated),
            Some(r) => {
                return Err(ScenarioError::protocol(format!(
                    "unexpected termination reason '{}'",
                    r
                )))
            }
        };

        Ok(Self { state, expires, reason })
    }
}
