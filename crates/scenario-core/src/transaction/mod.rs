//! SIP transactions as seen by a scenario actor
//!
//! A [`Transaction`] is one request plus the responses exchanged for it. The
//! invariants enforced here are the ones the scenarios rely on:
//!
//! - exactly one final response (2xx-6xx); a second final is a protocol error
//! - no provisional response after the final one
//! - a provisional code may repeat only with a different reason phrase, or
//!   from a different early dialog (To tag), as happens when a call is
//!   forked or diverted

pub mod state;

pub use state::{TransactionKind, TransactionState};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::errors::{ScenarioError, ScenarioResult};
use crate::sip::Method;

/// A response exchanged on a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status: u16,
    pub reason: String,
    pub to_tag: Option<String>,
}

/// One request and its responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub method: Method,
    pub cseq: u32,
    pub branch: String,
    pub state: TransactionState,
    pub responses: Vec<ResponseRecord>,
}

impl Transaction {
    pub fn new_client(method: Method, cseq: u32, branch: impl Into<String>) -> Self {
        let state = if method == Method::Invite {
            TransactionState::Calling
        } else {
            TransactionState::Trying
        };
        Self {
            kind: TransactionKind::Client,
            method,
            cseq,
            branch: branch.into(),
            state,
            responses: Vec::new(),
        }
    }

    pub fn new_server(method: Method, cseq: u32, branch: impl Into<String>) -> Self {
        Self {
            kind: TransactionKind::Server,
            method,
            cseq,
            branch: branch.into(),
            state: TransactionState::Trying,
            responses: Vec::new(),
        }
    }

    /// The final status, once one has been exchanged
    pub fn final_status(&self) -> Option<u16> {
        self.responses.iter().map(|r| r.status).find(|s| *s >= 200)
    }

    /// Whether the transaction still waits for its final response
    pub fn is_open(&self) -> bool {
        self.state.awaits_final()
    }

    /// Record a response received (client) or sent (server).
    pub fn apply_response(
        &mut self,
        status: u16,
        reason: &str,
        to_tag: Option<&str>,
    ) -> ScenarioResult<()> {
        if !(100..700).contains(&status) {
            return Err(ScenarioError::protocol(format!("invalid status code {}", status)));
        }

        if let Some(final_status) = self.final_status() {
            return if status >= 200 {
                Err(ScenarioError::protocol(format!(
                    "second final response {} on {} transaction (CSeq {}) already completed with {}",
                    status, self.method, self.cseq, final_status
                )))
            } else {
                Err(ScenarioError::unexpected_response(
                    format!("no further responses on {} (final {} already exchanged)", self.method, final_status),
                    format!("{} {}", status, reason),
                ))
            };
        }

        if status < 200 {
            if self
                .responses
                .iter()
                .any(|r| r.status == status && r.reason == reason && r.to_tag.as_deref() == to_tag)
            {
                return Err(ScenarioError::unexpected_response(
                    format!("at most one {} {} on {}", status, reason, self.method),
                    format!("repeated {} {}", status, reason),
                ));
            }
            self.responses.push(ResponseRecord {
                status,
                reason: reason.to_string(),
                to_tag: to_tag.map(str::to_string),
            });
            self.state = TransactionState::Proceeding;
            trace!(method = %self.method, cseq = self.cseq, status, "provisional response recorded");
            return Ok(());
        }

        self.responses.push(ResponseRecord {
            status,
            reason: reason.to_string(),
            to_tag: to_tag.map(str::to_string),
        });
        self.state = match (&self.method, self.kind, status) {
            // Non-2xx final to INVITE waits for its ACK
            (Method::Invite, _, 300..) => TransactionState::Completed,
            // 2xx to INVITE: the server side waits for the ACK
            (Method::Invite, TransactionKind::Server, _) => TransactionState::Completed,
            _ => TransactionState::Terminated,
        };
        trace!(method = %self.method, cseq = self.cseq, status, state = %self.state, "final response recorded");
        Ok(())
    }

    /// ACK sent (client) or received (server) for this INVITE transaction
    pub fn acknowledge(&mut self) -> ScenarioResult<()> {
        if self.method != Method::Invite {
            return Err(ScenarioError::protocol(format!(
                "ACK does not apply to a {} transaction",
                self.method
            )));
        }
        match self.final_status() {
            Some(_) => {
                self.state = TransactionState::Terminated;
                Ok(())
            }
            None => Err(ScenarioError::protocol(format!(
                "ACK before a final response to INVITE (CSeq {})",
                self.cseq
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisional_then_final() {
        let mut tx = Transaction::new_client(Method::Invite, 1, "z9hG4bK1");
        assert_eq!(tx.state, TransactionState::Calling);
        tx.apply_response(100, "Trying", None).unwrap();
        tx.apply_response(180, "Ringing", None).unwrap();
        assert_eq!(tx.state, TransactionState::Proceeding);
        tx.apply_response(200, "OK", None).unwrap();
        assert_eq!(tx.final_status(), Some(200));
        assert!(tx.state.is_terminated());
    }

    #[test]
    fn test_second_final_is_protocol_error() {
        let mut tx = Transaction::new_client(Method::Register, 1, "b");
        tx.apply_response(200, "OK", None).unwrap();
        assert!(matches!(
            tx.apply_response(200, "OK", None),
            Err(ScenarioError::Protocol { .. })
        ));
    }

    #[test]
    fn test_provisional_after_final_is_unexpected() {
        let mut tx = Transaction::new_client(Method::Invite, 1, "b");
        tx.apply_response(486, "Busy Here", None).unwrap();
        assert_eq!(tx.state, TransactionState::Completed);
        assert!(matches!(
            tx.apply_response(180, "Ringing", None),
            Err(ScenarioError::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn test_repeated_provisional_needs_new_reason() {
        let mut tx = Transaction::new_client(Method::Invite, 1, "b");
        tx.apply_response(180, "Ringing", None).unwrap();
        assert!(tx.apply_response(180, "Ringing", None).is_err());
        tx.apply_response(180, "Ringing (forwarded)", None).unwrap();
        assert_eq!(tx.responses.len(), 2);
    }

    #[test]
    fn test_provisional_from_another_early_dialog() {
        let mut tx = Transaction::new_client(Method::Invite, 1, "b");
        tx.apply_response(180, "Ringing", Some("leg1")).unwrap();
        tx.apply_response(181, "Call Is Being Forwarded", None).unwrap();
        tx.apply_response(180, "Ringing", Some("leg2")).unwrap();
        assert!(tx.apply_response(180, "Ringing", Some("leg2")).is_err());
    }

    #[test]
    fn test_ack_completes_failed_invite() {
        let mut tx = Transaction::new_server(Method::Invite, 3, "b");
        assert!(tx.acknowledge().is_err());
        tx.apply_response(408, "Request Timeout", None).unwrap();
        tx.acknowledge().unwrap();
        assert!(tx.state.is_terminated());
    }

    #[test]
    fn test_invalid_status_code() {
        let mut tx = Transaction::new_client(Method::Options, 1, "b");
        assert!(tx.apply_response(99, "Weird", None).is_err());
        assert!(tx.apply_response(700, "Weird", None).is_err());
    }
}
