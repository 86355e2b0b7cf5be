//! REGISTER exchanges of an endpoint
//!
//! All REGISTERs of one endpoint share a Call-ID and From tag, with the CSeq
//! increasing across refreshes and removals (RFC 3261 §10.2).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::call::via;
use super::identity::EndpointIdentity;
use super::inbox::Inbox;
use crate::dialog::{generate_branch, generate_call_id, generate_tag};
use crate::errors::{ScenarioError, ScenarioResult};
use crate::sip::{
    header_param, name_addr, tag_param, CSeq, Method, SipMessage, SipRequest, SipResponse, CALL_ID,
    CONTACT, CSEQ, EXPIRES, FROM, TO, VIA,
};
use crate::transaction::Transaction;

/// Registration state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Unregistered,
    /// Registered, with the expiry granted by the registrar
    Registered { expires: u32 },
    /// An `Expires: 0` REGISTER is in flight
    Expiring,
}

impl RegistrationState {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationState::Registered { .. })
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Unregistered => write!(f, "unregistered"),
            RegistrationState::Registered { expires } => write!(f, "registered ({}s)", expires),
            RegistrationState::Expiring => write!(f, "expiring"),
        }
    }
}

/// The Call-ID, tag and CSeq space used for an endpoint's REGISTERs
#[derive(Debug)]
pub(crate) struct RegistrationLeg {
    call_id: String,
    local_tag: String,
    cseq: u32,
    rx: mpsc::UnboundedReceiver<SipMessage>,
}

impl RegistrationLeg {
    pub(crate) fn new(identity: &EndpointIdentity, inbox: &Inbox) -> Self {
        let call_id = generate_call_id(identity.contact_host());
        let rx = inbox.route(&call_id);
        Self {
            call_id,
            local_tag: generate_tag(),
            cseq: 0,
            rx,
        }
    }

    pub(crate) fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Build the next REGISTER and its client transaction
    pub(crate) fn next_request(
        &mut self,
        identity: &EndpointIdentity,
        expires: u32,
    ) -> (SipRequest, Transaction) {
        self.cseq += 1;
        let branch = generate_branch();
        let registrar = identity
            .uri
            .rsplit_once('@')
            .map_or_else(|| identity.uri.clone(), |(_, domain)| format!("sip:{}", domain));

        let request = SipRequest::new(Method::Register, registrar)
            .with_header(VIA, via(identity.contact_host(), &branch))
            .with_header("Max-Forwards", "70")
            .with_header(FROM, name_addr(&identity.uri, Some(&self.local_tag)))
            .with_header(TO, name_addr(&identity.uri, None))
            .with_header(CALL_ID, self.call_id.clone())
            .with_header(CSEQ, format!("{} REGISTER", self.cseq))
            .with_header(CONTACT, identity.contact_header())
            .with_header(EXPIRES, expires.to_string());
        let transaction = Transaction::new_client(Method::Register, self.cseq, branch);
        (request, transaction)
    }

    /// Wait for the final response of `transaction`, skipping provisionals
    /// and responses to earlier REGISTERs
    pub(crate) async fn await_final(
        &mut self,
        transaction: &mut Transaction,
        timeout: Duration,
    ) -> ScenarioResult<SipResponse> {
        let deadline = Instant::now() + timeout;
        loop {
            let message = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    return Err(ScenarioError::transport(format!(
                        "registration channel {} closed",
                        self.call_id
                    )))
                }
                Err(_) => {
                    return Err(ScenarioError::receive_timeout(
                        format!("a final response to REGISTER (CSeq {})", transaction.cseq),
                        timeout,
                    ))
                }
            };

            let response = match message {
                SipMessage::Response(response) => response,
                SipMessage::Request(request) => {
                    warn!(call_id = %self.call_id, method = %request.method, "ignoring request on registration Call-ID");
                    continue;
                }
            };
            let cseq = response
                .header(CSEQ)
                .ok_or_else(|| ScenarioError::protocol("REGISTER response without CSeq"))
                .and_then(CSeq::parse)?;
            if cseq.method != Method::Register || cseq.number != transaction.cseq {
                warn!(call_id = %self.call_id, status = response.status, %cseq, "ignoring stale REGISTER response");
                continue;
            }
            transaction.apply_response(
                response.status,
                &response.reason,
                response.header(TO).and_then(tag_param),
            )?;
            if response.is_final() {
                debug!(call_id = %self.call_id, status = response.status, "REGISTER completed");
                return Ok(response);
            }
        }
    }
}

/// Expiry granted by a 2xx to REGISTER: the Expires header, else the
/// `expires` parameter of the first Contact, else what was requested
pub(crate) fn granted_expires(response: &SipResponse, requested: u32) -> u32 {
    response
        .header(EXPIRES)
        .and_then(|e| e.trim().parse().ok())
        .or_else(|| {
            response
                .header(CONTACT)
                .and_then(|c| header_param(c, "expires"))
                .and_then(|e| e.parse().ok())
        })
        .unwrap_or(requested)
}
