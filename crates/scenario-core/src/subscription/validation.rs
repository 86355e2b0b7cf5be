//! Structural validation of NOTIFY bodies
//!
//! A [`BodyValidator`] reports every problem it finds instead of stopping at
//! the first. Scenarios feed bodies through the test's
//! [`ValidationCollector`], which keeps going after a failed document so the
//! report lists all issues of the test at once.

use parking_lot::Mutex;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use super::reginfo::{AorState, ContactEvent, ContactState, RegInfoState, GRUUINFO_NS, REGINFO_NS};
use crate::errors::{ScenarioError, ScenarioResult};
use crate::xml::{attribute, local_name};

/// Black-box validator of one document type
pub trait BodyValidator: Send + Sync {
    /// Document type, used to label issues
    fn name(&self) -> &str;

    /// All issues found in `body`; empty when the document is valid
    fn validate(&self, body: &str) -> Vec<String>;
}

struct Walker {
    issues: Vec<String>,
}

impl Walker {
    fn attr(&mut self, elem: &BytesStart<'_>, name: &str) -> Option<String> {
        match attribute(elem, name) {
            Ok(Some(value)) => Some(value),
            Ok(None) => {
                self.issues
                    .push(format!("<{}> is missing attribute '{}'", local_name(elem), name));
                None
            }
            Err(e) => {
                self.issues.push(e.to_string());
                None
            }
        }
    }

    fn enumerated<T: std::str::FromStr>(&mut self, elem: &BytesStart<'_>, name: &str) {
        if let Some(value) = self.attr(elem, name) {
            if value.parse::<T>().is_err() {
                self.issues.push(format!(
                    "<{}> has invalid {} '{}'",
                    local_name(elem),
                    name,
                    value
                ));
            }
        }
    }

    fn numeric(&mut self, elem: &BytesStart<'_>, name: &str, required: bool) {
        let value = if required {
            self.attr(elem, name)
        } else {
            attribute(elem, name).ok().flatten()
        };
        if let Some(value) = value {
            if value.parse::<u32>().is_err() {
                self.issues.push(format!(
                    "<{}> has non-numeric {} '{}'",
                    local_name(elem),
                    name,
                    value
                ));
            }
        }
    }

    /// Walk every element of `body`, calling `check` on each opening tag
    fn walk(body: &str, mut check: impl FnMut(&mut Self, &BytesStart<'_>, usize)) -> Vec<String> {
        let mut walker = Walker { issues: Vec::new() };
        let mut reader = Reader::from_str(body);
        reader.config_mut().trim_text(true);
        let mut depth = 0usize;
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    check(&mut walker, e, depth);
                    depth += 1;
                }
                Ok(Event::Empty(ref e)) => check(&mut walker, e, depth),
                Ok(Event::End(_)) => depth = depth.saturating_sub(1),
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    walker.issues.push(format!("not well-formed: {}", e));
                    break;
                }
            }
            buf.clear();
        }
        walker.issues
    }
}

fn namespace_of(elem: &BytesStart<'_>) -> Option<String> {
    let prefix = elem.name().prefix().map(|p| String::from_utf8_lossy(p.as_ref()).into_owned());
    let xmlns = match &prefix {
        Some(p) => format!("xmlns:{}", p),
        None => "xmlns".to_string(),
    };
    attribute(elem, &xmlns).ok().flatten()
}

/// Validates `application/reginfo+xml` documents (RFC 3680, with the
/// RFC 5628 `pub-gruu` extension)
#[derive(Debug, Clone, Copy, Default)]
pub struct RegInfoValidator;

impl BodyValidator for RegInfoValidator {
    fn name(&self) -> &str {
        "reginfo"
    }

    fn validate(&self, body: &str) -> Vec<String> {
        let mut saw_root = false;
        let mut contact_uris = 0usize;
        let mut contacts = 0usize;
        let mut issues = Walker::walk(body, |w, e, depth| match local_name(e).as_str() {
            "reginfo" if depth == 0 => {
                saw_root = true;
                if namespace_of(e).as_deref() != Some(REGINFO_NS) {
                    w.issues.push(format!("root element is not in namespace {}", REGINFO_NS));
                }
                w.numeric(e, "version", true);
                w.enumerated::<RegInfoState>(e, "state");
            }
            "registration" => {
                w.attr(e, "aor");
                w.attr(e, "id");
                w.enumerated::<AorState>(e, "state");
            }
            "contact" => {
                contacts += 1;
                w.attr(e, "id");
                w.enumerated::<ContactState>(e, "state");
                w.enumerated::<ContactEvent>(e, "event");
                w.numeric(e, "expires", false);
            }
            "uri" => contact_uris += 1,
            "pub-gruu" => {
                w.attr(e, "uri");
            }
            name if depth == 0 => w.issues.push(format!("unexpected root element <{}>", name)),
            _ => {}
        });

        if !saw_root && issues.is_empty() {
            issues.push("document has no <reginfo> root".to_string());
        }
        if contact_uris < contacts {
            issues.push(format!("{} contact(s) without a <uri>", contacts - contact_uris));
        }
        issues
    }
}

/// Validates a standalone `pub-gruu` element (gruuinfo namespace)
#[derive(Debug, Clone, Copy, Default)]
pub struct GruuInfoValidator;

impl BodyValidator for GruuInfoValidator {
    fn name(&self) -> &str {
        "gruuinfo"
    }

    fn validate(&self, body: &str) -> Vec<String> {
        let mut elements = 0usize;
        let mut issues = Walker::walk(body, |w, e, depth| {
            elements += 1;
            if depth > 0 || local_name(e) != "pub-gruu" {
                w.issues.push(format!("unexpected element <{}>", local_name(e)));
                return;
            }
            if namespace_of(e).as_deref() != Some(GRUUINFO_NS) {
                w.issues.push(format!("pub-gruu is not in namespace {}", GRUUINFO_NS));
            }
            if let Some(uri) = w.attr(e, "uri") {
                if !uri.contains(";gr=") {
                    w.issues.push(format!("pub-gruu '{}' has no gr parameter", uri));
                }
            }
        });
        if elements == 0 && issues.is_empty() {
            issues.push("document has no pub-gruu element".to_string());
        }
        issues
    }
}

/// Collects validation issues across every scenario of one test
#[derive(Debug, Default)]
pub struct ValidationCollector {
    issues: Mutex<Vec<String>>,
}

impl ValidationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `body` and record any issues under `label`. Returns whether
    /// the document was valid.
    pub fn check(&self, label: &str, validator: &dyn BodyValidator, body: &str) -> bool {
        let found = validator.validate(body);
        if found.is_empty() {
            debug!(label, validator = validator.name(), "document valid");
            return true;
        }
        let mut issues = self.issues.lock();
        issues.extend(
            found
                .into_iter()
                .map(|issue| format!("{} ({}): {}", label, validator.name(), issue)),
        );
        false
    }

    pub fn issues(&self) -> Vec<String> {
        self.issues.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.lock().is_empty()
    }

    /// `Err(Validation)` carrying every recorded issue, if any
    pub fn to_result(&self) -> ScenarioResult<()> {
        let issues = self.issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ScenarioError::Validation { issues })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::reginfo::{AorRegistration, RegContact, RegInfo};

    fn reginfo() -> RegInfo {
        RegInfo::new(0, RegInfoState::Full).with_registration(
            AorRegistration::new("sip:a@x", "r1", AorState::Active).with_contact(
                RegContact::new("c1", "sip:a@10.0.0.1", ContactState::Active, ContactEvent::Registered)
                    .with_pub_gruu("sip:a@x;gr=urn:uuid:1234"),
            ),
        )
    }

    #[test]
    fn test_rendered_documents_are_valid() {
        let info = reginfo();
        assert!(RegInfoValidator.validate(&info.render().unwrap()).is_empty());
        let fragment = info.registrations[0].contacts[0].pub_gruu_fragment().unwrap().unwrap();
        assert!(GruuInfoValidator.validate(&fragment).is_empty());
    }

    #[test]
    fn test_reports_every_issue() {
        let body = r#"<reginfo xmlns="urn:ietf:params:xml:ns:reginfo" state="sideways">
            <registration aor="sip:a@x" state="active">
              <contact id="c" state="active" event="exploded"/>
            </registration>
          </reginfo>"#;
        let issues = RegInfoValidator.validate(body);
        assert_eq!(issues.len(), 5, "{:?}", issues);
    }

    #[test]
    fn test_wrong_documents() {
        assert!(!RegInfoValidator.validate("<presence/>").is_empty());
        assert!(!RegInfoValidator.validate("<reginfo").is_empty());
        assert!(!GruuInfoValidator.validate(r#"<pub-gruu uri="sip:a@x"/>"#).is_empty());
        assert!(!GruuInfoValidator.validate("").is_empty());
    }

    #[test]
    fn test_collector_accumulates() {
        let collector = ValidationCollector::new();
        assert!(collector.check("notify1", &RegInfoValidator, &reginfo().render().unwrap()));
        assert!(collector.to_result().is_ok());
        assert!(!collector.check("notify2", &RegInfoValidator, "<presence/>"));
        assert!(!collector.check("gruu", &GruuInfoValidator, "<x/>"));
        match collector.to_result() {
            Err(ScenarioError::Validation { issues }) => {
                assert!(issues.len() >= 2);
                assert!(issues[0].starts_with("notify2 (reginfo): "));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}
