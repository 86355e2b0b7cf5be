//! Notifier-side lifecycle of one event subscription
//!
//! ```text
//! pending ──SUBSCRIBE Expires>0──▶ active ──Expires=0 / expiry / deactivate──▶ terminated
//!    └──────────────SUBSCRIBE Expires=0──────────────────────────────────────────▶┘
//! ```
//!
//! Every transition that must be reported yields a [`Notification`] carrying
//! the CSeq and `Subscription-State` of the NOTIFY to send. CSeq values are
//! allocated here so they are strictly increasing; once a terminated
//! notification has been produced no further notifications are.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::state::{SubscriptionState, SubscriptionStateHeader, TerminationReason};
use crate::errors::{ScenarioError, ScenarioResult};

/// A NOTIFY the notifier must send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub cseq: u32,
    pub subscription_state: SubscriptionStateHeader,
}

impl Notification {
    pub fn is_final(&self) -> bool {
        self.subscription_state.is_terminated()
    }
}

/// State of one subscription as held by the notifier
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    /// Dialog identifier (Call-ID) of the subscription
    pub id: String,
    pub subscriber: String,
    pub resource: String,
    pub event_package: String,
    pub state: SubscriptionState,
    pub termination_reason: Option<TerminationReason>,
    pub expires_at: Option<Instant>,
    /// CSeq of the last NOTIFY produced (0 before the first)
    pub last_cseq: u32,
}

/// Drives a [`SubscriptionRecord`] through its lifecycle
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    record: SubscriptionRecord,
}

impl SubscriptionTracker {
    /// A pending subscription whose first NOTIFY will carry `first_cseq`
    pub fn new(
        id: impl Into<String>,
        subscriber: impl Into<String>,
        resource: impl Into<String>,
        event_package: impl Into<String>,
        first_cseq: u32,
    ) -> Self {
        Self {
            record: SubscriptionRecord {
                id: id.into(),
                subscriber: subscriber.into(),
                resource: resource.into(),
                event_package: event_package.into(),
                state: SubscriptionState::Pending,
                termination_reason: None,
                expires_at: None,
                last_cseq: first_cseq.saturating_sub(1),
            },
        }
    }

    pub fn record(&self) -> &SubscriptionRecord {
        &self.record
    }

    pub fn state(&self) -> SubscriptionState {
        self.record.state
    }

    pub fn is_terminated(&self) -> bool {
        self.record.state == SubscriptionState::Terminated
    }

    /// Whole seconds left before the subscription expires
    pub fn remaining(&self, now: Instant) -> u32 {
        self.record
            .expires_at
            .map(|at| at.saturating_duration_since(now).as_secs())
            .map_or(0, |secs| u32::try_from(secs).unwrap_or(u32::MAX))
    }

    fn ensure_live(&self, action: &str) -> ScenarioResult<()> {
        if self.is_terminated() {
            return Err(ScenarioError::protocol(format!(
                "cannot {} subscription {}: already terminated ({:?})",
                action, self.record.id, self.record.termination_reason
            )));
        }
        Ok(())
    }

    fn notify(&mut self, subscription_state: SubscriptionStateHeader) -> Notification {
        self.record.last_cseq += 1;
        Notification {
            cseq: self.record.last_cseq,
            subscription_state,
        }
    }

    fn terminate(&mut self, reason: TerminationReason) -> Notification {
        debug!(subscription = %self.record.id, %reason, "subscription terminated");
        self.record.state = SubscriptionState::Terminated;
        self.record.termination_reason = Some(reason);
        self.record.expires_at = None;
        self.notify(SubscriptionStateHeader::terminated(reason))
    }

    fn activate(&mut self, expires: u32, now: Instant) -> Notification {
        self.record.state = SubscriptionState::Active;
        self.record.expires_at = Some(now + Duration::from_secs(u64::from(expires)));
        let remaining = self.remaining(now);
        self.notify(SubscriptionStateHeader::active(remaining))
    }

    /// Initial SUBSCRIBE. `Expires: 0` is a one-shot fetch that terminates
    /// immediately.
    pub fn subscribe(&mut self, expires: u32, now: Instant) -> ScenarioResult<Notification> {
        if self.record.state != SubscriptionState::Pending {
            return Err(ScenarioError::protocol(format!(
                "subscription {} already {}",
                self.record.id, self.record.state
            )));
        }
        if expires == 0 {
            return Ok(self.terminate(TerminationReason::Timeout));
        }
        debug!(subscription = %self.record.id, expires, "subscription activated");
        Ok(self.activate(expires, now))
    }

    /// In-dialog SUBSCRIBE. `Expires: 0` unsubscribes.
    pub fn refresh(&mut self, expires: u32, now: Instant) -> ScenarioResult<Notification> {
        self.ensure_live("refresh")?;
        if expires == 0 {
            return Ok(self.terminate(TerminationReason::Timeout));
        }
        Ok(self.activate(expires, now))
    }

    /// The watched resource changed
    pub fn resource_changed(&mut self, now: Instant) -> ScenarioResult<Notification> {
        self.ensure_live("notify")?;
        if self.record.state != SubscriptionState::Active {
            return Err(ScenarioError::protocol(format!(
                "subscription {} is {}, not active",
                self.record.id, self.record.state
            )));
        }
        let remaining = self.remaining(now);
        Ok(self.notify(SubscriptionStateHeader::active(remaining)))
    }

    /// Terminate the subscription if it has expired by `now`
    pub fn expire(&mut self, now: Instant) -> Option<Notification> {
        match self.record.expires_at {
            Some(at) if self.record.state == SubscriptionState::Active && now >= at => {
                Some(self.terminate(TerminationReason::Timeout))
            }
            _ => None,
        }
    }

    /// Notifier-initiated termination
    pub fn deactivate(&mut self) -> ScenarioResult<Notification> {
        self.ensure_live("deactivate")?;
        Ok(self.terminate(TerminationReason::Deactivated))
    }
}
