//! Registration state documents (`application/reginfo+xml`, RFC 3680) with
//! GRUU extensions (RFC 5628)

use std::fmt;
use std::str::FromStr;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::errors::{ScenarioError, ScenarioResult};
use crate::xml::{attribute, local_name, xml_error, XmlDocument};

pub const REGINFO_CONTENT_TYPE: &str = "application/reginfo+xml";
pub const REGINFO_NS: &str = "urn:ietf:params:xml:ns:reginfo";
pub const GRUUINFO_NS: &str = "urn:ietf:params:xml:ns:gruuinfo";

macro_rules! xml_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ScenarioError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ScenarioError::xml(format!(
                        "invalid {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

xml_enum! {
    /// Whether a document carries the full state or a delta
    RegInfoState { Full => "full", Partial => "partial" }
}

xml_enum! {
    /// State of an address-of-record
    AorState { Init => "init", Active => "active", Terminated => "terminated" }
}

xml_enum! {
    /// State of one contact binding
    ContactState { Active => "active", Terminated => "terminated" }
}

xml_enum! {
    /// What happened to a contact binding
    ContactEvent {
        Registered => "registered",
        Created => "created",
        Refreshed => "refreshed",
        Shortened => "shortened",
        Expired => "expired",
        Deactivated => "deactivated",
        Probation => "probation",
        Unregistered => "unregistered",
        Rejected => "rejected",
    }
}

/// One contact binding of an address-of-record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegContact {
    pub id: String,
    pub state: ContactState,
    pub event: ContactEvent,
    pub uri: String,
    pub expires: Option<u32>,
    pub pub_gruu: Option<String>,
}

impl RegContact {
    pub fn new(id: impl Into<String>, uri: impl Into<String>, state: ContactState, event: ContactEvent) -> Self {
        Self {
            id: id.into(),
            state,
            event,
            uri: uri.into(),
            expires: None,
            pub_gruu: None,
        }
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_pub_gruu(mut self, gruu: impl Into<String>) -> Self {
        self.pub_gruu = Some(gruu.into());
        self
    }

    /// The `pub-gruu` element of this contact as a standalone gruuinfo
    /// document
    pub fn pub_gruu_fragment(&self) -> ScenarioResult<Option<String>> {
        let Some(gruu) = &self.pub_gruu else {
            return Ok(None);
        };
        let mut doc = XmlDocument::new()?;
        doc.empty("gr:pub-gruu", &[("xmlns:gr", GRUUINFO_NS), ("uri", gruu.as_str())])?;
        doc.finish().map(Some)
    }
}

/// Registration state of one address-of-record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AorRegistration {
    pub aor: String,
    pub id: String,
    pub state: AorState,
    pub contacts: Vec<RegContact>,
}

impl AorRegistration {
    pub fn new(aor: impl Into<String>, id: impl Into<String>, state: AorState) -> Self {
        Self {
            aor: aor.into(),
            id: id.into(),
            state,
            contacts: Vec::new(),
        }
    }

    pub fn with_contact(mut self, contact: RegContact) -> Self {
        self.contacts.push(contact);
        self
    }
}

/// A `reginfo` document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegInfo {
    pub version: u32,
    pub state: RegInfoState,
    pub registrations: Vec<AorRegistration>,
}

impl RegInfo {
    pub fn new(version: u32, state: RegInfoState) -> Self {
        Self {
            version,
            state,
            registrations: Vec::new(),
        }
    }

    pub fn with_registration(mut self, registration: AorRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    pub fn registration(&self, aor: &str) -> Option<&AorRegistration> {
        self.registrations.iter().find(|r| r.aor == aor)
    }

    pub fn contacts(&self) -> impl Iterator<Item = &RegContact> {
        self.registrations.iter().flat_map(|r| r.contacts.iter())
    }

    /// Every `pub-gruu` URI in document order
    pub fn pub_gruus(&self) -> Vec<&str> {
        self.contacts().filter_map(|c| c.pub_gruu.as_deref()).collect()
    }

    pub fn render(&self) -> ScenarioResult<String> {
        let version = self.version.to_string();
        let mut doc = XmlDocument::new()?;
        doc.start(
            "reginfo",
            &[
                ("xmlns", REGINFO_NS),
                ("xmlns:gr", GRUUINFO_NS),
                ("version", version.as_str()),
                ("state", self.state.as_str()),
            ],
        )?;
        for registration in &self.registrations {
            doc.start(
                "registration",
                &[
                    ("aor", registration.aor.as_str()),
                    ("id", registration.id.as_str()),
                    ("state", registration.state.as_str()),
                ],
            )?;
            for contact in &registration.contacts {
                let expires = contact.expires.map(|e| e.to_string());
                let mut attrs = vec![
                    ("id", contact.id.as_str()),
                    ("state", contact.state.as_str()),
                    ("event", contact.event.as_str()),
                ];
                if let Some(expires) = &expires {
                    attrs.push(("expires", expires.as_str()));
                }
                doc.start("contact", &attrs)?;
                doc.text_element("uri", &contact.uri)?;
                if let Some(gruu) = &contact.pub_gruu {
                    doc.empty("gr:pub-gruu", &[("uri", gruu.as_str())])?;
                }
                doc.end("contact")?;
            }
            doc.end("registration")?;
        }
        doc.end("reginfo")?;
        doc.finish()
    }

    pub fn parse(xml: &str) -> ScenarioResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut info: Option<RegInfo> = None;
        let mut in_uri = false;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf).map_err(xml_error)? {
                Event::Start(ref e) => {
                    in_uri = open_element(&mut info, e)?;
                }
                Event::Empty(ref e) => {
                    open_element(&mut info, e)?;
                }
                Event::Text(ref e) => {
                    if in_uri {
                        let text = e.unescape().map_err(xml_error)?;
                        current_contact(&mut info)?.uri = text.trim().to_string();
                    }
                }
                Event::End(_) => in_uri = false,
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        info.ok_or_else(|| ScenarioError::xml("document has no reginfo element"))
    }
}

fn required(elem: &BytesStart<'_>, name: &str) -> ScenarioResult<String> {
    attribute(elem, name)?.ok_or_else(|| {
        ScenarioError::xml(format!("<{}> without '{}' attribute", local_name(elem), name))
    })
}

fn current_contact(info: &mut Option<RegInfo>) -> ScenarioResult<&mut RegContact> {
    info.as_mut()
        .and_then(|i| i.registrations.last_mut())
        .and_then(|r| r.contacts.last_mut())
        .ok_or_else(|| ScenarioError::xml("contact data outside a <contact>"))
}

/// Apply an opening element; returns whether its text is the contact URI
fn open_element(info: &mut Option<RegInfo>, e: &BytesStart<'_>) -> ScenarioResult<bool> {
    match local_name(e).as_str() {
        "reginfo" => {
            let version = required(e, "version")?
                .parse()
                .map_err(|_| ScenarioError::xml("reginfo version is not a number"))?;
            *info = Some(RegInfo::new(version, required(e, "state")?.parse()?));
        }
        "registration" => {
            let registration =
                AorRegistration::new(required(e, "aor")?, required(e, "id")?, required(e, "state")?.parse()?);
            info.as_mut()
                .ok_or_else(|| ScenarioError::xml("<registration> outside <reginfo>"))?
                .registrations
                .push(registration);
        }
        "contact" => {
            let mut contact = RegContact::new(
                required(e, "id")?,
                String::new(),
                required(e, "state")?.parse()?,
                required(e, "event")?.parse()?,
            );
            contact.expires = attribute(e, "expires")?
                .map(|v| v.parse().map_err(|_| ScenarioError::xml("contact expires is not a number")))
                .transpose()?;
            info.as_mut()
                .and_then(|i| i.registrations.last_mut())
                .ok_or_else(|| ScenarioError::xml("<contact> outside <registration>"))?
                .contacts
                .push(contact);
        }
        "uri" => return Ok(true),
        "pub-gruu" => {
            let gruu = required(e, "uri")?;
            current_contact(info)?.pub_gruu = Some(gruu);
        }
        _ => {}
    }
    Ok(false)
}
