//! In-memory SIP message values
//!
//! These are the typed messages exchanged with a [`SipTransport`]. They are
//! not a wire codec: headers are kept as name/value strings and only the
//! handful of fields the scenarios inspect (Call-ID, CSeq, tags) get typed
//! accessors.
//!
//! [`SipTransport`]: crate::transport::SipTransport

use std::fmt;

use serde::{Deserialize, Serialize};

use super::method::Method;
use crate::errors::{ScenarioError, ScenarioResult};

pub const CALL_ID: &str = "Call-ID";
pub const CSEQ: &str = "CSeq";
pub const FROM: &str = "From";
pub const TO: &str = "To";
pub const VIA: &str = "Via";
pub const CONTACT: &str = "Contact";
pub const EXPIRES: &str = "Expires";
pub const EVENT: &str = "Event";
pub const SUBSCRIPTION_STATE: &str = "Subscription-State";
pub const CONTENT_TYPE: &str = "Content-Type";

/// Ordered collection of headers with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing ones with the same name
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace the first header with this name, or append it
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// First value for `name` (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Parsed CSeq header value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CSeq {
    pub number: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(number: u32, method: Method) -> Self {
        Self { number, method }
    }

    pub fn parse(value: &str) -> ScenarioResult<Self> {
        let mut parts = value.split_whitespace();
        let number = parts
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| ScenarioError::protocol(format!("malformed CSeq '{}'", value)))?;
        let method = parts
            .next()
            .ok_or_else(|| ScenarioError::protocol(format!("CSeq '{}' has no method", value)))?
            .parse()?;
        Ok(Self { number, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.number, self.method)
    }
}

/// Value of the `tag` parameter of a From/To header, if present
pub fn tag_param(value: &str) -> Option<&str> {
    // Parameters after the closing '>' (or the whole value for bare URIs)
    let params = match value.rfind('>') {
        Some(idx) => &value[idx + 1..],
        None => value,
    };
    params
        .split(';')
        .skip(1)
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| k.eq_ignore_ascii_case("tag"))
        .map(|(_, v)| v.trim())
}

/// The URI inside a name-addr (`"Bob" <sip:bob@x>;tag=1` → `sip:bob@x`)
pub fn addr_uri(value: &str) -> &str {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.split(';').next().unwrap_or(value).trim(),
    }
}

/// Render a name-addr with an optional tag
pub fn name_addr(uri: &str, tag: Option<&str>) -> String {
    match tag {
        Some(tag) => format!("<{}>;tag={}", uri, tag),
        None => format!("<{}>", uri),
    }
}

/// Value of a `;name=value` parameter on a header value
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    value
        .split(';')
        .skip(1)
        .filter_map(|p| p.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim().trim_matches('"'))
}

/// Default reason phrase for the status codes the scenarios exchange
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        401 => "Unauthorized",
        404 => "Not Found",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        489 => "Bad Event",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        600 => "Busy Everywhere",
        _ => "Unknown",
    }
}

/// A SIP request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipRequest {
    pub method: Method,
    pub uri: String,
    pub headers: Headers,
    pub body: String,
}

impl SipRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.headers.set(CONTENT_TYPE, content_type);
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

/// A SIP response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

impl SipResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    /// Build a response to `request`, copying the headers RFC 3261 §8.2.6
    /// requires (Via, From, To, Call-ID, CSeq).
    pub fn for_request(request: &SipRequest, status: u16, reason: impl Into<String>) -> Self {
        let mut response = Self::new(status, reason);
        for via in request.headers.get_all(VIA) {
            response.headers.push(VIA, via);
        }
        for name in [FROM, TO, CALL_ID, CSEQ] {
            if let Some(value) = request.header(name) {
                response.headers.push(name, value);
            }
        }
        response
    }

    /// Add or replace the To tag
    pub fn with_to_tag(mut self, tag: &str) -> Self {
        if let Some(to) = self.headers.get(TO) {
            let uri = addr_uri(to).to_string();
            self.headers.set(TO, name_addr(&uri, Some(tag)));
        }
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.headers.set(CONTENT_TYPE, content_type);
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_final(&self) -> bool {
        self.status >= 200
    }
}

/// Either a request or a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(r) => &r.headers,
            SipMessage::Response(r) => &r.headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header(CALL_ID)
    }

    pub fn cseq(&self) -> ScenarioResult<CSeq> {
        let value = self
            .header(CSEQ)
            .ok_or_else(|| ScenarioError::protocol(format!("missing CSeq in {}", self.summary())))?;
        CSeq::parse(value)
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.header(FROM).and_then(tag_param)
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.header(TO).and_then(tag_param)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    /// One-line description used in logs and error captures
    pub fn summary(&self) -> String {
        let call_id = self.call_id().unwrap_or("-");
        let cseq = self.header(CSEQ).unwrap_or("-");
        match self {
            SipMessage::Request(r) => {
                format!("{} {} (CSeq: {}, Call-ID: {})", r.method, r.uri, cseq, call_id)
            }
            SipMessage::Response(r) => {
                format!("{} {} (CSeq: {}, Call-ID: {})", r.status, r.reason, cseq, call_id)
            }
        }
    }
}

impl From<SipRequest> for SipMessage {
    fn from(request: SipRequest) -> Self {
        SipMessage::Request(request)
    }
}

impl From<SipResponse> for SipMessage {
    fn from(response: SipResponse) -> Self {
        SipMessage::Response(response)
    }
}
