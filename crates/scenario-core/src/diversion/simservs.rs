//! `simservs` XML documents carrying a communication-diversion service
//!
//! The rule set is published to the device in the MMTEL XCAP format
//! (3GPP TS 24.604): a `communication-diversion` element holding a
//! common-policy `ruleset`.

use quick_xml::events::Event;
use quick_xml::Reader;

use super::rules::{DiversionCondition, DiversionRule, DiversionRuleSet};
use crate::errors::{ScenarioError, ScenarioResult};
use crate::sip::MediaType;
use crate::xml::{attribute, local_name, xml_error, XmlDocument};

pub const SIMSERVS_CONTENT_TYPE: &str = "application/simservs+xml";
const SIMSERVS_NS: &str = "http://uri.etsi.org/ngn/params/xml/simservs/xcap";
const COMMON_POLICY_NS: &str = "urn:ietf:params:xml:ns:common-policy";

/// Render `rule_set` as a simservs document
pub fn render(rule_set: &DiversionRuleSet) -> ScenarioResult<String> {
    let mut doc = XmlDocument::new()?;
    doc.start("simservs", &[("xmlns", SIMSERVS_NS), ("xmlns:cp", COMMON_POLICY_NS)])?;
    doc.start(
        "communication-diversion",
        &[("active", if rule_set.active { "true" } else { "false" })],
    )?;
    doc.text_element("NoReplyTimer", &rule_set.no_answer_timeout_secs.to_string())?;
    doc.start("cp:ruleset", &[])?;

    for (idx, rule) in rule_set.rules.iter().enumerate() {
        let id = format!("rule{}", idx);
        doc.start("cp:rule", &[("id", id.as_str())])?;

        doc.start("cp:conditions", &[])?;
        for condition in &rule.conditions {
            doc.empty(condition.as_str(), &[])?;
        }
        for media in &rule.media_conditions {
            doc.text_element("media", media.as_str())?;
        }
        doc.end("cp:conditions")?;

        doc.start("cp:actions", &[])?;
        doc.start("forward-to", &[])?;
        doc.text_element("target", &rule.target)?;
        doc.end("forward-to")?;
        doc.end("cp:actions")?;

        doc.end("cp:rule")?;
    }

    doc.end("cp:ruleset")?;
    doc.end("communication-diversion")?;
    doc.end("simservs")?;
    doc.finish()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TextField {
    None,
    NoReplyTimer,
    Media,
    Target,
}

fn apply_condition(rule: &mut DiversionRule, name: &str) -> ScenarioResult<()> {
    let condition: DiversionCondition = name
        .parse()
        .map_err(|_| ScenarioError::xml(format!("unknown diversion condition <{}>", name)))?;
    rule.conditions.insert(condition);
    Ok(())
}

/// Read the communication-diversion service of a simservs document. A
/// document without one yields an inactive, empty rule set.
pub fn parse(xml: &str) -> ScenarioResult<DiversionRuleSet> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut rule_set = DiversionRuleSet::default();
    let mut current: Option<DiversionRule> = None;
    let mut in_conditions = false;
    let mut field = TextField::None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(xml_error)? {
            Event::Start(ref e) => match local_name(e).as_str() {
                "communication-diversion" => {
                    rule_set.active = attribute(e, "active")?.as_deref() != Some("false");
                }
                "NoReplyTimer" => field = TextField::NoReplyTimer,
                "rule" => current = Some(DiversionRule::to(String::new())),
                "conditions" => in_conditions = true,
                "media" if in_conditions => field = TextField::Media,
                "target" => field = TextField::Target,
                name if in_conditions => {
                    if let Some(rule) = current.as_mut() {
                        apply_condition(rule, name)?;
                    }
                }
                _ => {}
            },
            Event::Empty(ref e) => {
                if in_conditions {
                    if let Some(rule) = current.as_mut() {
                        apply_condition(rule, &local_name(e))?;
                    }
                }
            }
            Event::Text(ref e) => {
                let text = e.unescape().map_err(xml_error)?;
                match field {
                    TextField::NoReplyTimer => {
                        rule_set.no_answer_timeout_secs = text.trim().parse().map_err(|_| {
                            ScenarioError::xml(format!("NoReplyTimer '{}' is not a number", text))
                        })?;
                    }
                    TextField::Media => {
                        if let Some(rule) = current.as_mut() {
                            let media: MediaType = text.parse()?;
                            if !rule.media_conditions.contains(&media) {
                                rule.media_conditions.push(media);
                            }
                        }
                    }
                    TextField::Target => {
                        if let Some(rule) = current.as_mut() {
                            rule.target = text.trim().to_string();
                        }
                    }
                    TextField::None => {}
                }
                field = TextField::None;
            }
            Event::End(ref e) => match String::from_utf8_lossy(e.local_name().as_ref()).as_ref() {
                "conditions" => in_conditions = false,
                "rule" => {
                    if let Some(rule) = current.take() {
                        if rule.target.is_empty() {
                            return Err(ScenarioError::xml("diversion rule without a forward-to target"));
                        }
                        rule_set.rules.push(rule);
                    }
                }
                _ => field = TextField::None,
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(rule_set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_contains_ruleset() {
        let set = DiversionRuleSet::new(vec![
            DiversionRule::to("sip:callee2@example.com").when(DiversionCondition::NotRegistered),
        ]);
        let xml = render(&set).unwrap();
        assert!(xml.contains("<communication-diversion active=\"true\">"));
        assert!(xml.contains("<NoReplyTimer>20</NoReplyTimer>"));
        assert!(xml.contains("<not-registered/>"));
        assert!(xml.contains("<target>sip:callee2@example.com</target>"));
    }

    #[test]
    fn test_parse_reads_back_conditions_media_and_order() {
        let set = DiversionRuleSet::new(vec![
            DiversionRule::to("sip:callee2@example.com")
                .with_media(&[MediaType::Audio, MediaType::Video]),
            DiversionRule::to("sip:callee3@example.com")
                .when(DiversionCondition::Busy)
                .when(DiversionCondition::NoAnswer)
                .with_media(&[MediaType::Audio]),
            DiversionRule::to("12345"),
        ])
        .with_no_answer_timeout(35);
        assert_eq!(parse(&render(&set).unwrap()).unwrap(), set);
    }

    #[test]
    fn test_parse_foreign_document() {
        let xml = r#"<?xml version="1.0"?>
            <simservs xmlns="http://uri.etsi.org/ngn/params/xml/simservs/xcap"
                      xmlns:ss="http://uri.etsi.org/ngn/params/xml/simservs/xcap"
                      xmlns:cp="urn:ietf:params:xml:ns:common-policy">
              <ss:communication-diversion active="false">
                <cp:ruleset>
                  <cp:rule id="r1">
                    <cp:conditions><ss:busy/></cp:conditions>
                    <cp:actions><ss:forward-to><ss:target>tel:+15550100</ss:target></ss:forward-to></cp:actions>
                  </cp:rule>
                </cp:ruleset>
              </ss:communication-diversion>
            </simservs>"#;
        let set = parse(xml).unwrap();
        assert!(!set.active);
        assert_eq!(set.rules.len(), 1);
        assert!(set.rules[0].conditions.contains(&DiversionCondition::Busy));
        assert_eq!(set.rules[0].target, "tel:+15550100");
    }

    #[test]
    fn test_parse_rejects_unknown_condition() {
        let xml = "<simservs><communication-diversion><ruleset><rule><conditions><raining/></conditions></rule></ruleset></communication-diversion></simservs>";
        assert!(matches!(parse(xml), Err(ScenarioError::Xml { .. })));
    }

    #[test]
    fn test_empty_document_is_inactive() {
        let set = parse("<simservs/>").unwrap();
        assert!(!set.active);
        assert!(set.rules.is_empty());
    }
}
