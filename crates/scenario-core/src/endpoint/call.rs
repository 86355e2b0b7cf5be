//! Per-dialog operations used by scenarios
//!
//! A [`Call`] owns exactly one [`Dialog`] and the inbox channel carrying the
//! messages of its Call-ID. Sending goes through the owning endpoint's
//! transport; every receive is bounded by the configured receive timeout.
//!
//! Provisional responses are subject to the harness' [`ProvisionalPolicy`]:
//! under `Absorbed`, [`Call::recv_provisional`] does nothing and 18x
//! responses that arrive ahead of the awaited response are applied to the
//! dialog and then skipped.

use tokio::sync::mpsc;
use tracing::debug;

use super::endpoint_impl::Endpoint;
use super::inbox::ClaimedCall;
use crate::config::ProvisionalPolicy;
use crate::dialog::{generate_call_id, Dialog};
use crate::errors::{ScenarioError, ScenarioResult};
use crate::sip::{
    addr_uri, header_param, reason_phrase, sdp, tag_param, CSeq, MediaType, Method, SipMessage,
    SipRequest, SipResponse, APPLICATION_SDP, CALL_ID, CONTACT, CSEQ, FROM, TO, VIA,
};

/// Via header value for a request sent from `host`
pub(crate) fn via(host: &str, branch: &str) -> String {
    format!("SIP/2.0/SIM {};branch={}", host, branch)
}

fn branch_of(request: &SipRequest) -> String {
    request
        .header(VIA)
        .and_then(|v| header_param(v, "branch"))
        .unwrap_or_default()
        .to_string()
}

/// One call leg of an endpoint
#[derive(Debug)]
pub struct Call {
    endpoint: Endpoint,
    dialog: Dialog,
    rx: mpsc::UnboundedReceiver<SipMessage>,
    /// Request-URI of requests we send
    target: String,
    /// Requests received on this dialog, excluding ACK
    server_requests: Vec<SipRequest>,
}

impl Call {
    pub(crate) fn outgoing(endpoint: Endpoint, target: &str) -> Self {
        let identity = endpoint.identity();
        let call_id = generate_call_id(identity.contact_host());
        let rx = endpoint.inbox().route(&call_id);
        let dialog = Dialog::new_uac(call_id, identity.uri.clone(), target.to_string());
        endpoint.track_call(&dialog.call_id);
        debug!(endpoint = %identity.uri, call_id = %dialog.call_id, %target, "outgoing call created");
        Self {
            endpoint,
            dialog,
            rx,
            target: target.to_string(),
            server_requests: Vec::new(),
        }
    }

    pub(crate) fn incoming(endpoint: Endpoint, claimed: ClaimedCall) -> ScenarioResult<Self> {
        let ClaimedCall { call_id, first, rx } = claimed;
        let request = match &first {
            SipMessage::Request(request) => request,
            SipMessage::Response(_) => {
                endpoint.inbox().release(&call_id);
                return Err(ScenarioError::protocol(format!(
                    "incoming call started with a response: {}",
                    first.summary()
                )));
            }
        };

        let local_uri = request.header(TO).map(addr_uri).unwrap_or(endpoint.identity().uri.as_str()).to_string();
        let remote_uri = request.header(FROM).map(addr_uri).unwrap_or_default().to_string();
        let target = request
            .header(CONTACT)
            .map(addr_uri)
            .unwrap_or(remote_uri.as_str())
            .to_string();

        let dialog = match Dialog::new_uas(call_id.clone(), local_uri, remote_uri, first.from_tag()) {
            Ok(dialog) => dialog,
            Err(e) => {
                endpoint.inbox().release(&call_id);
                return Err(e);
            }
        };
        endpoint.track_call(&call_id);
        debug!(endpoint = %endpoint.uri(), %call_id, "incoming call created");
        Ok(Self {
            endpoint,
            dialog,
            rx,
            target,
            server_requests: Vec::new(),
        })
    }

    pub fn call_id(&self) -> &str {
        &self.dialog.call_id
    }

    pub fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Regenerate the Via branch for the next client transaction
    pub fn update_branch(&mut self) -> &str {
        self.dialog.update_branch()
    }

    async fn next_message(&mut self, waiting_for: &str) -> ScenarioResult<SipMessage> {
        let timeout = self.endpoint.config().receive_timeout();
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => {
                debug!(call_id = %self.dialog.call_id, message = %message.summary(), "received");
                Ok(message)
            }
            Ok(None) => Err(ScenarioError::transport(format!(
                "message channel of {} closed",
                self.dialog.call_id
            ))),
            Err(_) => Err(ScenarioError::receive_timeout(
                format!("{} on {}", waiting_for, self.dialog.call_id),
                timeout,
            )),
        }
    }

    /// Send a request on this dialog, opening a client transaction for it.
    ///
    /// `headers` override the generated ones. A non-empty body defaults to
    /// `application/sdp` unless `headers` name another Content-Type.
    pub async fn send_request(
        &mut self,
        method: Method,
        body: &str,
        headers: &[(&str, &str)],
    ) -> ScenarioResult<SipRequest> {
        let cseq = self.dialog.new_transaction(method.clone())?;
        let identity = self.endpoint.identity();

        let mut request = SipRequest::new(method, self.target.clone())
            .with_header(VIA, via(identity.contact_host(), self.dialog.branch()))
            .with_header("Max-Forwards", "70")
            .with_header(FROM, self.dialog.from_header())
            .with_header(TO, self.dialog.to_header())
            .with_header(CALL_ID, self.dialog.call_id.clone())
            .with_header(CSEQ, cseq.to_string())
            .with_header(CONTACT, identity.contact_header());
        if !body.is_empty() {
            request = request.with_body(APPLICATION_SDP, body);
        }
        for (name, value) in headers {
            request.headers.set(*name, *value);
        }

        self.endpoint.send(request.clone().into()).await?;
        Ok(request)
    }

    /// Send an INVITE offering one audio stream
    pub async fn send_invite_with_sdp(&mut self) -> ScenarioResult<SipRequest> {
        let offer = sdp::offer(self.endpoint.identity().contact_host(), &[MediaType::Audio]);
        self.send_request(Method::Invite, &offer, &[]).await
    }

    /// Send an INVITE offering audio and video
    pub async fn send_invite_with_video_sdp(&mut self) -> ScenarioResult<SipRequest> {
        let offer = sdp::offer(
            self.endpoint.identity().contact_host(),
            &[MediaType::Audio, MediaType::Video],
        );
        self.send_request(Method::Invite, &offer, &[]).await
    }

    fn apply_response(&mut self, response: &SipResponse) -> ScenarioResult<()> {
        let message = SipMessage::Response(response.clone());
        let cseq = message.cseq()?;
        self.dialog
            .recv_response(&cseq, response.status, &response.reason, message.to_tag())
    }

    /// Wait for a response with status `code` to the open client transaction
    pub async fn recv_response(&mut self, code: u16) -> ScenarioResult<SipResponse> {
        let absorbed = self.endpoint.config().provisional_policy == ProvisionalPolicy::Absorbed;
        loop {
            let message = self.next_message(&format!("a {} response", code)).await?;
            let response = match message {
                SipMessage::Response(response) => response,
                SipMessage::Request(request) => {
                    return Err(ScenarioError::unexpected_response(
                        code.to_string(),
                        format!("{} request", request.method),
                    ));
                }
            };
            self.apply_response(&response)?;

            if response.status == code {
                return Ok(response);
            }
            if absorbed && response.status > 100 && response.is_provisional() {
                debug!(call_id = %self.dialog.call_id, status = response.status, "skipping provisional response");
                continue;
            }
            return Err(ScenarioError::unexpected_response(
                code.to_string(),
                SipMessage::Response(response).summary(),
            ));
        }
    }

    /// Like [`recv_response`](Self::recv_response) for a 2xx, then bind the
    /// remote tag and establish the dialog
    pub async fn recv_response_and_create_dialog(&mut self, code: u16) -> ScenarioResult<SipResponse> {
        if !(200..300).contains(&code) {
            return Err(ScenarioError::protocol(format!(
                "a dialog can only be created by a 2xx, not {}",
                code
            )));
        }
        let response = self.recv_response(code).await?;
        self.dialog.set_remote_tag(response.header(TO).and_then(tag_param))?;
        self.dialog.establish()?;
        if let Some(contact) = response.header(CONTACT) {
            self.target = addr_uri(contact).to_string();
        }
        Ok(response)
    }

    /// Receive a provisional response the device may absorb. Returns `None`
    /// without waiting under the absorbed policy.
    pub async fn recv_provisional(&mut self, code: u16) -> ScenarioResult<Option<SipResponse>> {
        match self.endpoint.config().provisional_policy {
            ProvisionalPolicy::Absorbed => {
                debug!(call_id = %self.dialog.call_id, code, "provisional response may be absorbed, not waiting");
                Ok(None)
            }
            ProvisionalPolicy::Strict => self.recv_response(code).await.map(Some),
        }
    }

    fn bind_remote_tag(&mut self, tag: Option<&str>) -> ScenarioResult<()> {
        if self.dialog.remote_tag.is_some() {
            self.dialog.check_remote_tag(tag)
        } else {
            self.dialog.set_remote_tag(tag)
        }
    }

    fn accept_request(&mut self, request: &SipRequest) -> ScenarioResult<()> {
        let message = SipMessage::Request(request.clone());
        if self.dialog.remote_tag.is_some() {
            self.dialog.check_remote_tag(message.from_tag())?;
        }
        let cseq = message.cseq()?;
        self.dialog.recv_request(&cseq, &branch_of(request))?;
        if request.method != Method::Ack {
            self.server_requests.push(request.clone());
        }
        Ok(())
    }

    /// Wait for a request with this method on the dialog
    pub async fn recv_request(&mut self, method: Method) -> ScenarioResult<SipRequest> {
        let message = self.next_message(&format!("a {} request", method)).await?;
        let request = match message {
            SipMessage::Request(request) if request.method == method => request,
            other => {
                return Err(ScenarioError::protocol(format!(
                    "expected {} request, got {}",
                    method,
                    other.summary()
                )));
            }
        };
        self.accept_request(&request)?;
        Ok(request)
    }

    /// Receive the 2xx to a SUBSCRIBE and the NOTIFY it triggers, in either
    /// order, and establish the subscription dialog. Returns the NOTIFY,
    /// which is left open for [`send_response`](Self::send_response).
    pub async fn recv_200_and_notify(&mut self) -> ScenarioResult<SipRequest> {
        let mut notify: Option<SipRequest> = None;
        let mut answered = false;

        while notify.is_none() || !answered {
            match self.next_message("a 200 and a NOTIFY").await? {
                SipMessage::Response(response) if !answered && response.is_success() => {
                    self.apply_response(&response)?;
                    self.bind_remote_tag(response.header(TO).and_then(tag_param))?;
                    answered = true;
                }
                SipMessage::Request(request) if notify.is_none() && request.method == Method::Notify => {
                    self.bind_remote_tag(request.header(FROM).and_then(tag_param))?;
                    self.accept_request(&request)?;
                    notify = Some(request);
                }
                other => {
                    return Err(ScenarioError::unexpected_response(
                        "200 and NOTIFY",
                        other.summary(),
                    ));
                }
            }
        }

        self.dialog.establish()?;
        notify.ok_or_else(|| ScenarioError::protocol("NOTIFY missing after subscription"))
    }

    /// Send a response to the most recent open request received on the
    /// dialog
    pub async fn send_response(&mut self, code: u16, reason: &str) -> ScenarioResult<SipResponse> {
        self.respond(code, reason, None).await
    }

    /// Send a 200 to the INVITE with an SDP answer to its offer
    pub async fn send_200_with_sdp(&mut self) -> ScenarioResult<SipResponse> {
        let offer = self
            .server_requests
            .iter()
            .rev()
            .find(|r| r.method == Method::Invite)
            .map(|r| r.body.clone())
            .ok_or_else(|| ScenarioError::protocol("no INVITE received to answer"))?;
        let answer = sdp::answer(self.endpoint.identity().contact_host(), &offer);
        self.respond(200, reason_phrase(200), Some(answer)).await
    }

    async fn respond(&mut self, code: u16, reason: &str, sdp_body: Option<String>) -> ScenarioResult<SipResponse> {
        let cseq = self.dialog.send_response(code, reason)?;
        let request = self
            .server_requests
            .iter()
            .rev()
            .find(|r| {
                r.header(CSEQ)
                    .and_then(|v| CSeq::parse(v).ok())
                    .is_some_and(|c| c == cseq)
            })
            .ok_or_else(|| {
                ScenarioError::no_matching_transaction(format!("request with CSeq {}", cseq))
            })?;

        let mut response = SipResponse::for_request(request, code, reason);
        if code > 100 {
            response = response.with_to_tag(&self.dialog.local_tag);
        }
        if (200..300).contains(&code) && cseq.method.creates_dialog() {
            response = response.with_header(CONTACT, self.endpoint.identity().contact_header());
        }
        if let Some(body) = sdp_body {
            response = response.with_body(APPLICATION_SDP, body);
        }

        self.endpoint.send(response.clone().into()).await?;
        Ok(response)
    }

    /// Tear down the dialog and stop receiving its messages. Returns whether
    /// anything was torn down; later calls are no-ops.
    pub fn end_call(&mut self) -> bool {
        let ended = self.dialog.end_call();
        self.endpoint.forget_call(&self.dialog.call_id);
        if ended {
            debug!(call_id = %self.dialog.call_id, "call ended");
        }
        ended
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.endpoint.forget_call(&self.dialog.call_id);
    }
}
