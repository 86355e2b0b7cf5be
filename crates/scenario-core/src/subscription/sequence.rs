//! Subscriber-side checks on the NOTIFYs of one subscription

use super::state::SubscriptionStateHeader;
use crate::errors::{ScenarioError, ScenarioResult};
use crate::sip::{Method, SipMessage, SipRequest, SUBSCRIPTION_STATE};

/// Observes the NOTIFYs of one subscription in arrival order and rejects
/// sequences a conforming notifier cannot produce: non-increasing CSeq, a
/// NOTIFY after the terminating one, or `terminated` without a reason.
#[derive(Debug, Clone, Default)]
pub struct NotifySequence {
    first_cseq: Option<u32>,
    last_cseq: Option<u32>,
    last_state: Option<SubscriptionStateHeader>,
    count: usize,
}

impl NotifySequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record a received NOTIFY
    pub fn observe(&mut self, notify: &SipRequest) -> ScenarioResult<SubscriptionStateHeader> {
        if notify.method != Method::Notify {
            return Err(ScenarioError::protocol(format!(
                "expected NOTIFY, got {}",
                notify.method
            )));
        }
        let cseq = SipMessage::Request(notify.clone()).cseq()?;
        let state: SubscriptionStateHeader = notify
            .header(SUBSCRIPTION_STATE)
            .ok_or_else(|| ScenarioError::protocol("NOTIFY without Subscription-State"))?
            .parse()?;
        self.observe_parts(cseq.number, state)?;
        Ok(state)
    }

    /// Check and record a NOTIFY given its CSeq number and state
    pub fn observe_parts(&mut self, cseq: u32, state: SubscriptionStateHeader) -> ScenarioResult<()> {
        if let Some(last) = self.last_state.filter(|s| s.is_terminated()) {
            return Err(ScenarioError::protocol(format!(
                "NOTIFY (CSeq {}) after terminating NOTIFY ({})",
                cseq, last
            )));
        }
        if let Some(last) = self.last_cseq {
            if cseq <= last {
                return Err(ScenarioError::protocol(format!(
                    "NOTIFY CSeq not increasing: {} then {}",
                    last, cseq
                )));
            }
        }
        if state.is_terminated() && state.reason.is_none() {
            return Err(ScenarioError::protocol(format!(
                "terminating NOTIFY (CSeq {}) carries no reason",
                cseq
            )));
        }

        self.first_cseq.get_or_insert(cseq);
        self.last_cseq = Some(cseq);
        self.last_state = Some(state);
        self.count += 1;
        Ok(())
    }

    pub fn first_cseq(&self) -> Option<u32> {
        self.first_cseq
    }

    pub fn last_cseq(&self) -> Option<u32> {
        self.last_cseq
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_terminated(&self) -> bool {
        self.last_state.is_some_and(|s| s.is_terminated())
    }
}
