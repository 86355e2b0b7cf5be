//! Per-endpoint demultiplexer for inbound SIP messages
//!
//! The network delivers everything addressed to an endpoint's contact into
//! its [`Inbox`]. Messages whose Call-ID belongs to a live [`Call`] go
//! straight to that call's channel. Requests for an unknown Call-ID are
//! parked until a scenario claims them with `incoming_call()`.
//!
//! INVITE arrivals are counted whether or not they are claimed, so
//! `no_new_calls()` reports any call that reached the endpoint since the
//! last `checkpoint()`.
//!
//! [`Call`]: super::Call

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{ScenarioError, ScenarioResult};
use crate::sip::{Method, SipMessage};

/// An inbound call handed to a scenario: the first request of the new
/// Call-ID plus the channel carrying it and everything after it.
#[derive(Debug)]
pub struct ClaimedCall {
    pub call_id: String,
    pub first: SipMessage,
    pub rx: mpsc::UnboundedReceiver<SipMessage>,
}

/// Routes inbound messages by Call-ID
#[derive(Debug)]
pub struct Inbox {
    owner: String,
    routes: DashMap<String, mpsc::UnboundedSender<SipMessage>>,
    /// Requests for Call-IDs nobody has claimed yet, in arrival order.
    /// Also serializes route installation against delivery.
    unclaimed: Mutex<VecDeque<SipMessage>>,
    arrived: Notify,
    /// INVITEs delivered since the last checkpoint
    invites: AtomicUsize,
}

impl Inbox {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            routes: DashMap::new(),
            unclaimed: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
            invites: AtomicUsize::new(0),
        }
    }

    /// URI of the endpoint this inbox belongs to
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Register a Call-ID we are about to use for an outgoing request
    pub fn route(&self, call_id: &str) -> mpsc::UnboundedReceiver<SipMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _guard = self.unclaimed.lock();
        self.routes.insert(call_id.to_string(), tx);
        rx
    }

    /// Stop routing a Call-ID; later messages for it are treated as new
    pub fn release(&self, call_id: &str) {
        self.routes.remove(call_id);
    }

    /// Deliver one inbound message. Never blocks.
    pub fn deliver(&self, message: SipMessage) {
        let Some(call_id) = message.call_id().map(str::to_string) else {
            warn!(owner = %self.owner, message = %message.summary(), "dropping message without Call-ID");
            return;
        };

        if matches!(&message, SipMessage::Request(r) if r.method == Method::Invite) {
            self.invites.fetch_add(1, Ordering::SeqCst);
        }

        let mut unclaimed = self.unclaimed.lock();
        if let Some(route) = self.routes.get(&call_id) {
            if let Err(returned) = route.send(message) {
                debug!(owner = %self.owner, message = %returned.0.summary(), "call no longer listening, message dropped");
            }
            return;
        }

        if message.is_request() {
            debug!(owner = %self.owner, message = %message.summary(), "new inbound request parked");
            unclaimed.push_back(message);
            drop(unclaimed);
            self.arrived.notify_waiters();
        } else {
            warn!(owner = %self.owner, message = %message.summary(), "stray response for unknown Call-ID dropped");
        }
    }

    fn try_claim(&self) -> Option<ClaimedCall> {
        let mut unclaimed = self.unclaimed.lock();
        let first = unclaimed.pop_front()?;
        let call_id = first.call_id().unwrap_or_default().to_string();

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(first.clone());
        let mut remaining = VecDeque::with_capacity(unclaimed.len());
        for message in unclaimed.drain(..) {
            if message.call_id() == Some(call_id.as_str()) {
                let _ = tx.send(message);
            } else {
                remaining.push_back(message);
            }
        }
        *unclaimed = remaining;
        self.routes.insert(call_id.clone(), tx);

        Some(ClaimedCall { call_id, first, rx })
    }

    /// Claim the oldest unclaimed inbound request, waiting up to `timeout`
    pub async fn claim_next(&self, timeout: Duration) -> ScenarioResult<ClaimedCall> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claimed) = self.try_claim() {
                debug!(owner = %self.owner, call_id = %claimed.call_id, "incoming call claimed");
                return Ok(claimed);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ScenarioError::receive_timeout(
                    format!("an incoming call to {}", self.owner),
                    timeout,
                ));
            }
        }
    }

    /// True iff no INVITE has arrived since the last checkpoint, claimed
    /// or not
    pub fn no_new_calls(&self) -> bool {
        self.invites.load(Ordering::SeqCst) == 0
    }

    /// Start a new observation window: discard unclaimed INVITEs and reset
    /// the arrival count. Returns how many INVITEs arrived in the window
    /// that just ended.
    pub fn checkpoint(&self) -> usize {
        let mut unclaimed = self.unclaimed.lock();
        let arrived = self.invites.swap(0, Ordering::SeqCst);
        let before = unclaimed.len();
        unclaimed.retain(|m| !matches!(m, SipMessage::Request(r) if r.method == Method::Invite));
        let dropped = before - unclaimed.len();
        if dropped > 0 {
            debug!(owner = %self.owner, dropped, "checkpoint discarded unclaimed INVITEs");
        }
        arrived
    }

    #[cfg(test)]
    fn unclaimed_len(&self) -> usize {
        self.unclaimed.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::{message::CALL_ID, SipRequest, SipResponse};

    fn request(method: Method, call_id: &str) -> SipMessage {
        SipRequest::new(method, "sip:bob@example.com")
            .with_header(CALL_ID, call_id)
            .into()
    }

    #[tokio::test]
    async fn test_routed_messages_bypass_unclaimed_queue() {
        let inbox = Inbox::new("sip:bob@example.com");
        let mut rx = inbox.route("c1");
        inbox.deliver(request(Method::Bye, "c1"));
        assert!(rx.recv().await.is_some());
        assert_eq!(inbox.unclaimed_len(), 0);
    }

    #[tokio::test]
    async fn test_claim_collects_same_call_id() {
        let inbox = Inbox::new("sip:bob@example.com");
        inbox.deliver(request(Method::Invite, "c1"));
        inbox.deliver(request(Method::Invite, "c2"));
        inbox.deliver(request(Method::Cancel, "c1"));
        assert!(!inbox.no_new_calls());

        let mut claimed = inbox.claim_next(Duration::from_secs(1)).await.unwrap();
        assert_eq!(claimed.call_id, "c1");
        assert!(claimed.rx.recv().await.is_some());
        assert!(matches!(
            claimed.rx.recv().await,
            Some(SipMessage::Request(r)) if r.method == Method::Cancel
        ));
        assert_eq!(inbox.unclaimed_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_waits_for_delivery() {
        let inbox = std::sync::Arc::new(Inbox::new("sip:bob@example.com"));
        let deliverer = inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            deliverer.deliver(request(Method::Invite, "late"));
        });
        let claimed = inbox.claim_next(Duration::from_secs(1)).await.unwrap();
        assert_eq!(claimed.call_id, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_times_out() {
        let inbox = Inbox::new("sip:bob@example.com");
        let err = inbox.claim_next(Duration::from_millis(500)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_checkpoint_and_stray_responses() {
        let inbox = Inbox::new("sip:bob@example.com");
        inbox.deliver(SipResponse::new(200, "OK").with_header(CALL_ID, "nobody").into());
        assert_eq!(inbox.unclaimed_len(), 0);

        inbox.deliver(request(Method::Invite, "c1"));
        inbox.deliver(request(Method::Options, "c2"));
        assert!(!inbox.no_new_calls());
        assert_eq!(inbox.checkpoint(), 1);
        assert!(inbox.no_new_calls());
        assert_eq!(inbox.unclaimed_len(), 1);
    }

    #[tokio::test]
    async fn test_claimed_invite_still_counts_as_new_call() {
        let inbox = Inbox::new("sip:bob@example.com");
        inbox.deliver(request(Method::Invite, "c1"));
        let _claimed = inbox.claim_next(Duration::from_secs(1)).await.unwrap();
        assert_eq!(inbox.unclaimed_len(), 0);
        assert!(!inbox.no_new_calls());

        assert_eq!(inbox.checkpoint(), 1);
        assert!(inbox.no_new_calls());

        // An INVITE on a routed Call-ID is an arrival too
        let _rx = inbox.route("c2");
        inbox.deliver(request(Method::Invite, "c2"));
        assert!(!inbox.no_new_calls());
    }
}
