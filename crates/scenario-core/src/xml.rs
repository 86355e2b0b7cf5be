//! Small helpers over quick-xml shared by the simservs and reginfo documents

use std::fmt::Display;
use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::errors::{ScenarioError, ScenarioResult};

pub(crate) fn xml_error(e: impl Display) -> ScenarioError {
    ScenarioError::xml(e.to_string())
}

/// Event-based XML document builder with two-space indentation
pub(crate) struct XmlDocument {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl XmlDocument {
    pub(crate) fn new() -> ScenarioResult<Self> {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;
        Ok(Self { writer })
    }

    fn element<'a>(name: &'a str, attrs: &[(&str, &str)]) -> BytesStart<'a> {
        let mut elem = BytesStart::new(name);
        for attr in attrs {
            elem.push_attribute(*attr);
        }
        elem
    }

    pub(crate) fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> ScenarioResult<()> {
        self.writer
            .write_event(Event::Start(Self::element(name, attrs)))
            .map_err(xml_error)
    }

    pub(crate) fn end(&mut self, name: &str) -> ScenarioResult<()> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(xml_error)
    }

    pub(crate) fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> ScenarioResult<()> {
        self.writer
            .write_event(Event::Empty(Self::element(name, attrs)))
            .map_err(xml_error)
    }

    pub(crate) fn text_element(&mut self, name: &str, text: &str) -> ScenarioResult<()> {
        self.start(name, &[])?;
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(xml_error)?;
        self.end(name)
    }

    pub(crate) fn finish(self) -> ScenarioResult<String> {
        String::from_utf8(self.writer.into_inner().into_inner()).map_err(xml_error)
    }
}

/// Unescaped value of attribute `name`, if present
pub(crate) fn attribute(elem: &BytesStart<'_>, name: &str) -> ScenarioResult<Option<String>> {
    match elem.try_get_attribute(name).map_err(xml_error)? {
        Some(attr) => Ok(Some(attr.unescape_value().map_err(xml_error)?.into_owned())),
        None => Ok(None),
    }
}

/// Element name without its namespace prefix
pub(crate) fn local_name(elem: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(elem.local_name().as_ref()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_builder() {
        let mut doc = XmlDocument::new().unwrap();
        doc.start("root", &[("version", "1")]).unwrap();
        doc.text_element("item", "a < b").unwrap();
        doc.empty("flag", &[]).unwrap();
        doc.end("root").unwrap();
        let xml = doc.finish().unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<root version=\"1\">"));
        assert!(xml.contains("<item>a &lt; b</item>"));
        assert!(xml.contains("<flag/>"));
    }
}
