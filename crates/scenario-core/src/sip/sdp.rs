//! Minimal SDP offers and answers
//!
//! Scenarios only care about which media streams an INVITE offers (call
//! diversion can be conditioned on it), so this module builds and reads the
//! `m=` lines and nothing more.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ScenarioError;

pub const APPLICATION_SDP: &str = "application/sdp";

/// A media type offered in an SDP `m=` line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Text,
    Message,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Text => "text",
            MediaType::Message => "message",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            MediaType::Audio => 49170,
            MediaType::Video => 51372,
            MediaType::Text => 53000,
            MediaType::Message => 54000,
        }
    }

    fn default_format(&self) -> &'static str {
        match self {
            MediaType::Audio => "RTP/AVP 0",
            MediaType::Video => "RTP/AVP 96",
            MediaType::Text => "RTP/AVP 98",
            MediaType::Message => "TCP/MSRP *",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = ScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(MediaType::Audio),
            "video" => Ok(MediaType::Video),
            "text" => Ok(MediaType::Text),
            "message" => Ok(MediaType::Message),
            other => Err(ScenarioError::protocol(format!("unknown media type '{}'", other))),
        }
    }
}

/// Build an SDP session description offering `media`, one stream each
pub fn offer(host: &str, media: &[MediaType]) -> String {
    let session_id = rand::random::<u32>();
    let mut sdp = format!(
        "v=0\r\no=- {id} {id} IN IP4 {host}\r\ns=sipdrill\r\nc=IN IP4 {host}\r\nt=0 0\r\n",
        id = session_id,
        host = host
    );
    for m in media {
        sdp.push_str(&format!(
            "m={} {} {}\r\na=sendrecv\r\n",
            m.as_str(),
            m.default_port(),
            m.default_format()
        ));
    }
    sdp
}

/// Build an answer accepting every stream of `offer_body`
pub fn answer(host: &str, offer_body: &str) -> String {
    offer(host, &offered_media(offer_body))
}

/// Media types offered by an SDP body, in `m=` line order. Streams with port
/// 0 are rejected streams and are not reported; unknown media types are
/// skipped.
pub fn offered_media(body: &str) -> Vec<MediaType> {
    body.lines()
        .filter_map(|line| line.trim().strip_prefix("m="))
        .filter_map(|m| {
            let mut fields = m.split_whitespace();
            let media = fields.next()?.parse::<MediaType>().ok()?;
            let port = fields.next()?;
            (port != "0").then_some(media)
        })
        .collect()
}
