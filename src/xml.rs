//! Helpers for the XML persistence documents.
//!
//! Bundles, share roots and recents are persisted as small XML files. These
//! wrappers keep the quick-xml plumbing in one place: an indenting writer for
//! attribute-only documents and an attribute map reader for parsing.

use std::collections::HashMap;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use crate::error::Error;

/// Incremental writer for attribute-heavy XML documents
pub struct XmlWriter {
    writer: Writer<Vec<u8>>,
}

impl XmlWriter {
    /// Start a document with the standard declaration
    pub fn new() -> Self {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
        let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)));
        Self { writer }
    }

    /// Open an element with attributes
    pub fn open(&mut self, tag: &str, attrs: &[(&str, String)]) {
        let mut el = BytesStart::new(tag);
        for (k, v) in attrs {
            el.push_attribute((*k, v.as_str()));
        }
        let _ = self.writer.write_event(Event::Start(el));
    }

    /// Write a self-closing element with attributes
    pub fn empty(&mut self, tag: &str, attrs: &[(&str, String)]) {
        let mut el = BytesStart::new(tag);
        for (k, v) in attrs {
            el.push_attribute((*k, v.as_str()));
        }
        let _ = self.writer.write_event(Event::Empty(el));
    }

    /// Close an element opened with [`XmlWriter::open`]
    pub fn close(&mut self, tag: &str) {
        let _ = self.writer.write_event(Event::End(BytesEnd::new(tag)));
    }

    /// Finish the document
    pub fn finish(self) -> String {
        String::from_utf8(self.writer.into_inner()).unwrap_or_default()
    }
}

impl Default for XmlWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Collect an element's attributes into a name → value map
pub fn attr_map(el: &BytesStart<'_>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for attr in el.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if let Ok(value) = attr.unescape_value() {
            out.insert(key, value.into_owned());
        }
    }
    out
}

/// Parse a required attribute, converting parse failures into a readable error
pub fn required<T: std::str::FromStr>(
    attrs: &HashMap<String, String>,
    name: &str,
    document: &std::path::Path,
) -> Result<T, Error> {
    attrs
        .get(name)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::Persistence {
            path: document.to_path_buf(),
            message: format!("missing or invalid attribute {name}"),
        })
}

/// Parse an optional attribute, ignoring unparseable values
pub fn optional<T: std::str::FromStr>(attrs: &HashMap<String, String>, name: &str) -> Option<T> {
    attrs.get(name).and_then(|v| v.parse().ok())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use quick_xml::Reader;
    use std::path::Path;

    #[test]
    fn writer_produces_nested_attribute_documents() {
        let mut w = XmlWriter::new();
        w.open("Bundle", &[("Token", "7".into()), ("Target", "/dl/x".into())]);
        w.empty("Segment", &[("Start", "0".into()), ("Size", "100".into())]);
        w.close("Bundle");
        let doc = w.finish();

        assert!(doc.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(doc.contains("<Bundle Token=\"7\" Target=\"/dl/x\">"));
        assert!(doc.contains("<Segment Start=\"0\" Size=\"100\"/>"));
        assert!(doc.contains("</Bundle>"));
    }

    #[test]
    fn attributes_round_trip_with_escaping() {
        let mut w = XmlWriter::new();
        w.empty("File", &[("Name", "a&b \"c\".bin".into())]);
        let doc = w.finish();

        let mut reader = Reader::from_str(&doc);
        loop {
            match reader.read_event().unwrap() {
                Event::Empty(el) => {
                    let attrs = attr_map(&el);
                    assert_eq!(attrs["Name"], "a&b \"c\".bin");
                    break;
                }
                Event::Eof => panic!("element not found"),
                _ => {}
            }
        }
    }

    #[test]
    fn required_attribute_errors_name_the_document() {
        let attrs = HashMap::from([("Size".to_string(), "notanumber".to_string())]);
        let err = required::<u64>(&attrs, "Size", Path::new("/state/bundles/9.xml")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("9.xml"));
        assert!(msg.contains("Size"));
    }

    #[test]
    fn optional_attribute_tolerates_absence_and_junk() {
        let attrs = HashMap::from([("A".to_string(), "5".to_string())]);
        assert_eq!(optional::<u64>(&attrs, "A"), Some(5));
        assert_eq!(optional::<u64>(&attrs, "B"), None);

        let junk = HashMap::from([("A".to_string(), "x".to_string())]);
        assert_eq!(optional::<u64>(&junk, "A"), None);
    }
}
