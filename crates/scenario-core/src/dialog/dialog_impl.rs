//! Dialog implementation for scenario call legs
//!
//! This module contains the main Dialog struct: tags, the two independent
//! CSeq spaces, the ordered list of transactions and the dialog state. It is
//! pure bookkeeping; the [`Call`](crate::endpoint::Call) drives it from the
//! messages it sends and receives.

use serde::{Serialize, Deserialize};
use tracing::debug;

use super::dialog_state::DialogState;
use super::dialog_utils::{generate_branch, generate_tag, is_valid_tag};
use crate::errors::{ScenarioError, ScenarioResult};
use crate::sip::{name_addr, CSeq, Method};
use crate::transaction::{Transaction, TransactionKind};

/// A SIP dialog (or dialog-to-be) as seen by one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialog {
    /// Current state of the dialog
    pub state: DialogState,

    /// Call-ID for this dialog
    pub call_id: String,

    /// Local URI
    pub local_uri: String,

    /// Remote URI
    pub remote_uri: String,

    /// Local tag
    pub local_tag: String,

    /// Remote tag, learned from the dialog-creating exchange
    pub remote_tag: Option<String>,

    /// Last CSeq number used on a request we sent
    pub local_cseq: u32,

    /// Last CSeq number seen on a request we received (0 = none yet)
    pub remote_cseq: u32,

    /// Whether this dialog was created by local UA (true) or remote UA (false)
    pub is_initiator: bool,

    /// Via branch for the next client transaction
    branch: String,

    /// Client and server transactions, in creation order
    transactions: Vec<Transaction>,
}

impl Dialog {
    /// Create the caller side of a dialog
    pub fn new_uac(call_id: String, local_uri: String, remote_uri: String) -> Self {
        Self {
            state: DialogState::Initial,
            call_id,
            local_uri,
            remote_uri,
            local_tag: generate_tag(),
            remote_tag: None,
            local_cseq: 0,
            remote_cseq: 0,
            is_initiator: true,
            branch: generate_branch(),
            transactions: Vec::new(),
        }
    }

    /// Create the callee side of a dialog from the first inbound request
    pub fn new_uas(
        call_id: String,
        local_uri: String,
        remote_uri: String,
        remote_tag: Option<&str>,
    ) -> ScenarioResult<Self> {
        if let Some(tag) = remote_tag {
            if !is_valid_tag(tag) {
                return Err(ScenarioError::dialog_establishment(format!(
                    "malformed From tag '{}' on {}",
                    tag, call_id
                )));
            }
        }
        Ok(Self {
            state: DialogState::Initial,
            call_id,
            local_uri,
            remote_uri,
            local_tag: generate_tag(),
            remote_tag: remote_tag.map(str::to_string),
            local_cseq: 0,
            remote_cseq: 0,
            is_initiator: false,
            branch: generate_branch(),
            transactions: Vec::new(),
        })
    }

    /// From header value for requests we send
    pub fn from_header(&self) -> String {
        name_addr(&self.local_uri, Some(&self.local_tag))
    }

    /// To header value for requests we send
    pub fn to_header(&self) -> String {
        name_addr(&self.remote_uri, self.remote_tag.as_deref())
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Regenerate the Via branch used for the next client transaction
    pub fn update_branch(&mut self) -> &str {
        self.branch = generate_branch();
        &self.branch
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// The client transaction still waiting for its final response, if any
    pub fn open_client_transaction(&self) -> Option<&Transaction> {
        self.transactions
            .iter()
            .rev()
            .find(|tx| tx.kind == TransactionKind::Client && tx.is_open())
    }

    fn last_transaction_mut(&mut self, kind: TransactionKind, method: &Method) -> Option<&mut Transaction> {
        self.transactions
            .iter_mut()
            .rev()
            .find(|tx| tx.kind == kind && tx.method == *method)
    }

    fn ensure_not_terminated(&self, action: &str) -> ScenarioResult<()> {
        if self.state.is_terminated() {
            return Err(ScenarioError::protocol(format!(
                "cannot {} on terminated dialog {}",
                action, self.call_id
            )));
        }
        Ok(())
    }

    /// Open a client transaction for `method` and return the CSeq to send.
    ///
    /// ACK and CANCEL reuse the CSeq of the INVITE they refer to. Any other
    /// method fails while a client transaction is still open.
    pub fn new_transaction(&mut self, method: Method) -> ScenarioResult<CSeq> {
        self.ensure_not_terminated(&format!("send {}", method))?;

        if method.is_reentrant() {
            let branch = self.branch.clone();
            let invite = self
                .last_transaction_mut(TransactionKind::Client, &Method::Invite)
                .ok_or_else(|| {
                    ScenarioError::protocol(format!("{} without a preceding INVITE", method))
                })?;
            let cseq = invite.cseq;

            if method == Method::Ack {
                let failed = invite.final_status().is_some_and(|s| s >= 300);
                invite.acknowledge()?;
                if failed {
                    debug!(call_id = %self.call_id, "ACK sent for failed INVITE, dialog terminated");
                    self.state = DialogState::Terminated;
                }
            } else {
                self.transactions
                    .push(Transaction::new_client(method.clone(), cseq, branch));
            }
            return Ok(CSeq::new(cseq, method));
        }

        if let Some(open) = self.open_client_transaction() {
            return Err(ScenarioError::protocol(format!(
                "cannot start {} while {} (CSeq {}) is still {}",
                method, open.method, open.cseq, open.state
            )));
        }

        self.local_cseq += 1;
        let cseq = self.local_cseq;
        self.transactions
            .push(Transaction::new_client(method.clone(), cseq, self.branch.clone()));
        Ok(CSeq::new(cseq, method))
    }

    /// Apply a response received for the client transaction identified by
    /// `cseq`.
    pub fn recv_response(
        &mut self,
        cseq: &CSeq,
        status: u16,
        reason: &str,
        to_tag: Option<&str>,
    ) -> ScenarioResult<()> {
        let call_id = self.call_id.clone();
        let tx = self
            .transactions
            .iter_mut()
            .rev()
            .find(|tx| {
                tx.kind == TransactionKind::Client && tx.cseq == cseq.number && tx.method == cseq.method
            })
            .ok_or_else(|| {
                ScenarioError::no_matching_transaction(format!(
                    "{} {} (CSeq {}) on {}",
                    status, reason, cseq, call_id
                ))
            })?;
        tx.apply_response(status, reason, to_tag)?;

        if tx.method == Method::Bye && (200..300).contains(&status) {
            debug!(call_id = %self.call_id, "BYE answered, dialog terminated");
            self.state = DialogState::Terminated;
        }
        Ok(())
    }

    /// Record the remote tag learned from a 2xx or an initial NOTIFY
    pub fn set_remote_tag(&mut self, tag: Option<&str>) -> ScenarioResult<()> {
        let tag = tag.ok_or_else(|| {
            ScenarioError::dialog_establishment(format!("no remote tag on {}", self.call_id))
        })?;
        if !is_valid_tag(tag) {
            return Err(ScenarioError::dialog_establishment(format!(
                "malformed remote tag '{}' on {}",
                tag, self.call_id
            )));
        }
        if let Some(existing) = &self.remote_tag {
            return Err(ScenarioError::dialog_establishment(format!(
                "remote tag already set to '{}' on {} (got '{}')",
                existing, self.call_id, tag
            )));
        }
        self.remote_tag = Some(tag.to_string());
        Ok(())
    }

    /// Check that `tag` is the remote tag already recorded for this dialog
    pub fn check_remote_tag(&self, tag: Option<&str>) -> ScenarioResult<()> {
        match (&self.remote_tag, tag) {
            (Some(expected), Some(tag)) if expected == tag => Ok(()),
            (expected, tag) => Err(ScenarioError::dialog_establishment(format!(
                "remote tag mismatch on {}: dialog has {:?}, message has {:?}",
                self.call_id, expected, tag
            ))),
        }
    }

    /// Move to Established once the dialog-creating client transaction has
    /// a 2xx final response and the remote tag is known.
    pub fn establish(&mut self) -> ScenarioResult<()> {
        self.ensure_not_terminated("establish dialog")?;
        let creating = self
            .transactions
            .iter()
            .rev()
            .find(|tx| tx.kind == TransactionKind::Client && tx.method.creates_dialog())
            .ok_or_else(|| {
                ScenarioError::dialog_establishment(format!(
                    "no dialog-creating request sent on {}",
                    self.call_id
                ))
            })?;
        match creating.final_status() {
            Some(status) if (200..300).contains(&status) => {}
            other => {
                return Err(ScenarioError::dialog_establishment(format!(
                    "{} on {} has final status {:?}, not 2xx",
                    creating.method, self.call_id, other
                )));
            }
        }
        if self.remote_tag.is_none() {
            return Err(ScenarioError::dialog_establishment(format!(
                "no remote tag known on {}",
                self.call_id
            )));
        }
        if self.state != DialogState::Established {
            debug!(call_id = %self.call_id, remote_tag = ?self.remote_tag, "dialog established");
            self.state = DialogState::Established;
        }
        Ok(())
    }

    /// Validate and record an inbound request, opening a server transaction
    /// for it (ACK is matched to its INVITE server transaction instead).
    pub fn recv_request(&mut self, cseq: &CSeq, branch: &str) -> ScenarioResult<()> {
        self.ensure_not_terminated(&format!("receive {}", cseq.method))?;

        match cseq.method {
            Method::Ack => {
                let call_id = self.call_id.clone();
                let invite = self
                    .last_transaction_mut(TransactionKind::Server, &Method::Invite)
                    .filter(|tx| tx.cseq == cseq.number)
                    .ok_or_else(|| {
                        ScenarioError::dialog_establishment(format!(
                            "ACK CSeq {} does not match any INVITE on {}",
                            cseq.number, call_id
                        ))
                    })?;
                let failed = invite.final_status().is_some_and(|s| s >= 300);
                invite.acknowledge()?;
                if failed {
                    debug!(call_id = %self.call_id, "ACK received for failed INVITE, dialog terminated");
                    self.state = DialogState::Terminated;
                }
                Ok(())
            }
            Method::Cancel => {
                let call_id = self.call_id.clone();
                self.last_transaction_mut(TransactionKind::Server, &Method::Invite)
                    .filter(|tx| tx.cseq == cseq.number)
                    .ok_or_else(|| {
                        ScenarioError::no_matching_transaction(format!(
                            "CANCEL (CSeq {}) on {}",
                            cseq.number, call_id
                        ))
                    })?;
                self.transactions
                    .push(Transaction::new_server(Method::Cancel, cseq.number, branch));
                Ok(())
            }
            _ => {
                if self.remote_cseq != 0 && cseq.number <= self.remote_cseq {
                    return Err(ScenarioError::dialog_establishment(format!(
                        "remote CSeq not increasing on {}: got {} after {}",
                        self.call_id, cseq, self.remote_cseq
                    )));
                }
                self.remote_cseq = cseq.number;
                self.transactions
                    .push(Transaction::new_server(cseq.method.clone(), cseq.number, branch));
                Ok(())
            }
        }
    }

    /// Apply a response we are sending to the most recent open server
    /// transaction and return that transaction's CSeq.
    pub fn send_response(&mut self, status: u16, reason: &str) -> ScenarioResult<CSeq> {
        self.ensure_not_terminated(&format!("send {}", status))?;

        let local_tag = self.local_tag.clone();
        let call_id = self.call_id.clone();
        let tx = self
            .transactions
            .iter_mut()
            .rev()
            .find(|tx| tx.kind == TransactionKind::Server && tx.is_open())
            .ok_or_else(|| {
                ScenarioError::no_matching_transaction(format!(
                    "outgoing {} {} on {}",
                    status, reason, call_id
                ))
            })?;
        // 100 Trying never carries a To tag
        let tag = (status > 100).then_some(local_tag.as_str());
        tx.apply_response(status, reason, tag)?;
        let cseq = CSeq::new(tx.cseq, tx.method.clone());

        if (200..300).contains(&status) {
            if cseq.method.creates_dialog() && self.state == DialogState::Initial {
                debug!(call_id = %self.call_id, "dialog established by outgoing 2xx");
                self.state = DialogState::Established;
            } else if cseq.method == Method::Bye {
                debug!(call_id = %self.call_id, "BYE answered, dialog terminated");
                self.state = DialogState::Terminated;
            }
        }
        Ok(cseq)
    }

    /// Tear down the dialog and drop all transaction state. Returns whether
    /// anything was torn down; a second call is a no-op.
    pub fn end_call(&mut self) -> bool {
        if self.state.is_terminated() && self.transactions.is_empty() {
            return false;
        }
        self.state = DialogState::Terminated;
        self.transactions.clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uac() -> Dialog {
        Dialog::new_uac(
            "call-1@example.com".into(),
            "sip:alice@example.com".into(),
            "sip:bob@example.com".into(),
        )
    }

    #[test]
    fn test_uac_invite_bye_lifecycle() {
        let mut dialog = uac();
        let invite = dialog.new_transaction(Method::Invite).unwrap();
        assert_eq!(invite, CSeq::new(1, Method::Invite));
        dialog.recv_response(&invite, 100, "Trying", None).unwrap();
        dialog.recv_response(&invite, 180, "Ringing", Some("b1")).unwrap();
        dialog.recv_response(&invite, 200, "OK", Some("b1")).unwrap();
        dialog.set_remote_tag(Some("b1")).unwrap();
        dialog.establish().unwrap();
        assert_eq!(dialog.state, DialogState::Established);
        assert_eq!(dialog.to_header(), "<sip:bob@example.com>;tag=b1");

        let ack = dialog.new_transaction(Method::Ack).unwrap();
        assert_eq!(ack.number, 1);

        let bye = dialog.new_transaction(Method::Bye).unwrap();
        assert_eq!(bye, CSeq::new(2, Method::Bye));
        dialog.recv_response(&bye, 200, "OK", Some("b1")).unwrap();
        assert!(dialog.state.is_terminated());
    }

    #[test]
    fn test_second_invite_while_open_is_rejected() {
        let mut dialog = uac();
        dialog.new_transaction(Method::Invite).unwrap();
        assert!(matches!(
            dialog.new_transaction(Method::Invite),
            Err(ScenarioError::Protocol { .. })
        ));
        // CANCEL is allowed alongside the open INVITE and reuses its CSeq
        let cancel = dialog.new_transaction(Method::Cancel).unwrap();
        assert_eq!(cancel, CSeq::new(1, Method::Cancel));
    }

    #[test]
    fn test_response_without_transaction() {
        let mut dialog = uac();
        let cseq = CSeq::new(5, Method::Invite);
        assert!(matches!(
            dialog.recv_response(&cseq, 200, "OK", None),
            Err(ScenarioError::NoMatchingTransaction { .. })
        ));
    }

    #[test]
    fn test_remote_tag_rules() {
        let mut dialog = uac();
        let invite = dialog.new_transaction(Method::Invite).unwrap();
        dialog.recv_response(&invite, 200, "OK", Some("bad tag")).unwrap();
        assert!(matches!(
            dialog.set_remote_tag(Some("bad tag")),
            Err(ScenarioError::DialogEstablishment { .. })
        ));
        assert!(dialog.set_remote_tag(None).is_err());
        dialog.set_remote_tag(Some("good")).unwrap();
        assert!(dialog.set_remote_tag(Some("other")).is_err());
        dialog.check_remote_tag(Some("good")).unwrap();
        assert!(dialog.check_remote_tag(Some("other")).is_err());
    }

    #[test]
    fn test_establish_requires_2xx() {
        let mut dialog = uac();
        let invite = dialog.new_transaction(Method::Invite).unwrap();
        dialog.recv_response(&invite, 180, "Ringing", Some("b1")).unwrap();
        dialog.set_remote_tag(Some("b1")).unwrap();
        assert!(dialog.establish().is_err());
    }

    #[test]
    fn test_failed_invite_terminates_on_ack() {
        let mut dialog = uac();
        let invite = dialog.new_transaction(Method::Invite).unwrap();
        dialog.recv_response(&invite, 480, "Temporarily Unavailable", Some("x")).unwrap();
        assert_eq!(dialog.state, DialogState::Initial);
        dialog.new_transaction(Method::Ack).unwrap();
        assert!(dialog.state.is_terminated());
    }

    #[test]
    fn test_uas_cseq_must_increase() {
        let mut dialog = Dialog::new_uas(
            "call-2".into(),
            "sip:bob@example.com".into(),
            "sip:alice@example.com".into(),
            Some("a1"),
        )
        .unwrap();
        dialog.recv_request(&CSeq::new(1, Method::Subscribe), "b1").unwrap();
        dialog.send_response(200, "OK").unwrap();
        dialog.recv_request(&CSeq::new(2, Method::Notify), "b2").unwrap();
        dialog.send_response(200, "OK").unwrap();
        assert!(matches!(
            dialog.recv_request(&CSeq::new(2, Method::Notify), "b3"),
            Err(ScenarioError::DialogEstablishment { .. })
        ));
    }

    #[test]
    fn test_uas_invite_lifecycle() {
        let mut dialog =
            Dialog::new_uas("call-3".into(), "sip:bob@x".into(), "sip:alice@x".into(), Some("a1"))
                .unwrap();
        dialog.recv_request(&CSeq::new(7, Method::Invite), "b1").unwrap();
        dialog.send_response(100, "Trying").unwrap();
        dialog.send_response(180, "Ringing").unwrap();
        dialog.send_response(200, "OK").unwrap();
        assert!(dialog.state.is_established());
        assert!(dialog.recv_request(&CSeq::new(6, Method::Ack), "b1").is_err());
        dialog.recv_request(&CSeq::new(7, Method::Ack), "b1").unwrap();
        dialog.recv_request(&CSeq::new(8, Method::Bye), "b2").unwrap();
        let cseq = dialog.send_response(200, "OK").unwrap();
        assert_eq!(cseq.method, Method::Bye);
        assert!(dialog.state.is_terminated());
    }

    #[test]
    fn test_uas_rejects_malformed_from_tag() {
        assert!(Dialog::new_uas("c".into(), "sip:b@x".into(), "sip:a@x".into(), Some("")).is_err());
    }

    #[test]
    fn test_end_call_is_idempotent() {
        let mut dialog = uac();
        dialog.new_transaction(Method::Invite).unwrap();
        assert!(dialog.end_call());
        assert!(!dialog.end_call());
        assert!(dialog.transactions().is_empty());
        assert!(dialog.new_transaction(Method::Bye).is_err());
    }
}
