//! SIP message model shared by endpoints, the orchestrator and network
//! implementations

pub mod message;
pub mod method;
pub mod sdp;

pub use message::{
    addr_uri, header_param, name_addr, reason_phrase, tag_param, CSeq, Headers, SipMessage,
    SipRequest, SipResponse, CALL_ID, CONTACT, CONTENT_TYPE, CSEQ, EVENT, EXPIRES, FROM,
    SUBSCRIPTION_STATE, TO, VIA,
};
pub use method::Method;
pub use sdp::{MediaType, APPLICATION_SDP};
