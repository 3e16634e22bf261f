//! Namespaced XML element tree.
//!
//! Every NETCONF message, filter, and datastore payload is handled as an
//! [`Element`] tree. Parsing resolves namespace prefixes with quick-xml's
//! `NsReader`; serialization re-declares namespaces wherever an element's
//! namespace differs from its parent's.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{PrefixDeclaration, ResolveResult};
use quick_xml::NsReader;
use std::fmt;
use thiserror::Error;

/// The namespace bound to the reserved `xml` prefix.
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// XML parse errors.
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML syntax error: {0}")]
    Syntax(String),

    #[error("unknown namespace prefix '{0}'")]
    UnknownPrefix(String),

    #[error("document has no root element")]
    NoRoot,

    #[error("unexpected content after the root element")]
    TrailingContent,

    #[error("unclosed element <{0}>")]
    Unclosed(String),

    #[error("invalid UTF-8 in document")]
    InvalidUtf8,
}

fn syntax(err: impl fmt::Display) -> XmlError {
    XmlError::Syntax(err.to_string())
}

/// An attribute with its resolved namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub ns: Option<String>,
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            ns: None,
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn with_ns(ns: impl Into<String>, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            ns: Some(ns.into()),
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An XML element.
///
/// Character data is stored trimmed in `text`; mixed content is not
/// modelled. `ns_decls` records the prefix declarations seen on this element
/// while parsing (the default namespace uses the empty prefix). They are
/// kept for resolving prefixes inside attribute values such as XPath
/// `select` expressions and take no part in equality.
#[derive(Debug, Clone, Default)]
pub struct Element {
    pub ns: Option<String>,
    pub name: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Element>,
    pub text: Option<String>,
    pub ns_decls: Vec<(String, String)>,
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.ns == other.ns
            && self.name == other.name
            && self.attributes == other.attributes
            && self.text == other.text
            && self.children == other.children
    }
}

impl Eq for Element {}

impl Element {
    /// Creates an element without a namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Creates an element in the given namespace.
    pub fn new_ns(ns: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ns: Some(ns.into()),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute::new(name, value));
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(child);
    }

    /// Returns true if this element has the given namespace and local name.
    pub fn is(&self, ns: &str, name: &str) -> bool {
        self.name == name && self.ns.as_deref() == Some(ns)
    }

    /// Returns the value of an unqualified attribute.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.ns.is_none() && a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Returns the value of a namespaced attribute.
    pub fn attr_ns(&self, ns: &str, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.ns.as_deref() == Some(ns) && a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Returns the first child with the given local name, in any namespace.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Returns the first child with the given namespace and local name.
    pub fn child_ns(&self, ns: &str, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(ns, name))
    }

    /// Returns all children with the given local name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follows a chain of local names from this element.
    pub fn find(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |el, name| el.child(name))
    }

    /// Returns the text content, or an empty string.
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Copies name, namespace, and attributes but no content.
    pub fn shallow_clone(&self) -> Element {
        Element {
            ns: self.ns.clone(),
            name: self.name.clone(),
            attributes: self.attributes.clone(),
            children: Vec::new(),
            text: None,
            ns_decls: self.ns_decls.clone(),
        }
    }

    /// Parses a document from bytes.
    pub fn from_bytes(input: &[u8]) -> Result<Element, XmlError> {
        let text = std::str::from_utf8(input).map_err(|_| XmlError::InvalidUtf8)?;
        Self::parse(text)
    }

    /// Parses a document containing exactly one root element.
    pub fn parse(input: &str) -> Result<Element, XmlError> {
        let mut reader = NsReader::from_str(input.trim());
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let (resolved, event) = reader.read_resolved_event().map_err(syntax)?;
            let ns = match event {
                Event::Start(_) | Event::Empty(_) => namespace_of(resolved)?,
                _ => {
                    drop(resolved);
                    None
                }
            };

            match event {
                Event::Start(start) => {
                    if root.is_some() {
                        return Err(XmlError::TrailingContent);
                    }
                    stack.push(open_element(&reader, ns, &start)?);
                }
                Event::Empty(start) => {
                    if root.is_some() {
                        return Err(XmlError::TrailingContent);
                    }
                    let element = open_element(&reader, ns, &start)?;
                    attach(&mut stack, &mut root, element);
                }
                Event::End(_) => {
                    if let Some(element) = stack.pop() {
                        attach(&mut stack, &mut root, element);
                    }
                }
                Event::Text(text) => {
                    let value = text.unescape().map_err(syntax)?;
                    append_text(&mut stack, &value)?;
                }
                Event::CData(data) => {
                    let bytes = data.into_inner();
                    let value = std::str::from_utf8(&bytes).map_err(|_| XmlError::InvalidUtf8)?;
                    append_text(&mut stack, value)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.pop() {
            return Err(XmlError::Unclosed(open.name));
        }
        root.ok_or(XmlError::NoRoot)
    }

    /// Serializes without insignificant whitespace.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write(&mut out, None, None);
        out
    }

    /// Serializes with two-space indentation.
    pub fn to_pretty_xml(&self) -> String {
        let mut out = String::new();
        self.write(&mut out, None, Some(0));
        out
    }

    fn write(&self, out: &mut String, parent_ns: Option<&str>, depth: Option<usize>) {
        if let Some(depth) = depth {
            if depth > 0 {
                out.push('\n');
            }
            out.push_str(&"  ".repeat(depth));
        }

        out.push('<');
        out.push_str(&self.name);
        if self.ns.as_deref() != parent_ns {
            out.push_str(" xmlns=\"");
            out.push_str(&escape(self.ns.as_deref().unwrap_or("")));
            out.push('"');
        }

        let mut generated = 0usize;
        for attr in &self.attributes {
            out.push(' ');
            match attr.ns.as_deref() {
                None => {}
                Some(XML_NS) => out.push_str("xml:"),
                Some(ns) => {
                    let prefix = format!("a{}", generated);
                    generated += 1;
                    out.push_str(&format!("xmlns:{}=\"{}\" {}:", prefix, escape(ns), prefix));
                }
            }
            out.push_str(&attr.name);
            out.push_str("=\"");
            out.push_str(&escape(&attr.value));
            out.push('"');
        }

        if self.children.is_empty() && self.text.is_none() {
            out.push_str("/>");
            return;
        }
        out.push('>');

        if let Some(ref text) = self.text {
            out.push_str(&escape(text));
        }
        for child in &self.children {
            child.write(out, self.ns.as_deref(), depth.map(|d| d + 1));
        }
        if let Some(depth) = depth {
            if !self.children.is_empty() {
                out.push('\n');
                out.push_str(&"  ".repeat(depth));
            }
        }

        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

fn namespace_of(resolved: ResolveResult<'_>) -> Result<Option<String>, XmlError> {
    match resolved {
        ResolveResult::Bound(ns) => {
            let ns = std::str::from_utf8(ns.as_ref()).map_err(|_| XmlError::InvalidUtf8)?;
            Ok(if ns.is_empty() {
                None
            } else {
                Some(ns.to_string())
            })
        }
        ResolveResult::Unbound => Ok(None),
        ResolveResult::Unknown(prefix) => Err(XmlError::UnknownPrefix(
            String::from_utf8_lossy(&prefix).into_owned(),
        )),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, XmlError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| XmlError::InvalidUtf8)
}

fn open_element(
    reader: &NsReader<&[u8]>,
    ns: Option<String>,
    start: &BytesStart<'_>,
) -> Result<Element, XmlError> {
    let mut element = Element {
        ns,
        name: utf8(start.local_name().as_ref())?,
        ..Default::default()
    };

    for attr in start.attributes() {
        let attr = attr.map_err(syntax)?;
        let value = attr.unescape_value().map_err(syntax)?.into_owned();

        if let Some(binding) = attr.key.as_namespace_binding() {
            let prefix = match binding {
                PrefixDeclaration::Default => String::new(),
                PrefixDeclaration::Named(prefix) => utf8(prefix)?,
            };
            element.ns_decls.push((prefix, value));
            continue;
        }

        let is_xml_prefixed = attr
            .key
            .prefix()
            .map(|p| p.as_ref() == b"xml")
            .unwrap_or(false);
        let (ns, local) = if is_xml_prefixed {
            (Some(XML_NS.to_string()), attr.key.local_name())
        } else {
            let (resolved, local) = reader.resolve_attribute(attr.key);
            (namespace_of(resolved)?, local)
        };

        element.attributes.push(Attribute {
            ns,
            name: utf8(local.as_ref())?,
            value,
        });
    }

    Ok(element)
}

fn attach(stack: &mut Vec<Element>, root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => *root = Some(element),
    }
}

fn append_text(stack: &mut [Element], value: &str) -> Result<(), XmlError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(());
    }
    match stack.last_mut() {
        Some(parent) => {
            parent.text.get_or_insert_with(String::new).push_str(value);
            Ok(())
        }
        None => Err(XmlError::Syntax("text outside of the root element".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolves_default_and_prefixed_namespaces() {
        let doc = r#"<rpc xmlns="urn:a" xmlns:b="urn:b" message-id="7">
            <b:get><filter b:type="subtree"/></b:get>
        </rpc>"#;
        let root = Element::parse(doc).unwrap();

        assert!(root.is("urn:a", "rpc"));
        assert_eq!(root.attr("message-id"), Some("7"));
        let get = root.child("get").unwrap();
        assert!(get.is("urn:b", "get"));
        let filter = get.child("filter").unwrap();
        assert!(filter.is("urn:a", "filter"));
        assert_eq!(filter.attr_ns("urn:b", "type"), Some("subtree"));
        assert_eq!(filter.attr("type"), None);
        assert!(root
            .ns_decls
            .contains(&("b".to_string(), "urn:b".to_string())));
    }

    #[test]
    fn test_parse_text_and_entities() {
        let root = Element::parse("<a><b> x &amp; y </b><c><![CDATA[<raw>]]></c></a>").unwrap();
        assert_eq!(root.child("b").unwrap().text(), "x & y");
        assert_eq!(root.child("c").unwrap().text(), "<raw>");
        assert!(root.text.is_none());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Element::parse("<p:a/>"),
            Err(XmlError::UnknownPrefix(_))
        ));
        assert!(matches!(Element::parse(""), Err(XmlError::NoRoot)));
        assert!(matches!(
            Element::parse("<a/><b/>"),
            Err(XmlError::TrailingContent)
        ));
        assert!(Element::parse("<a><b></a>").is_err());
        assert!(Element::parse("<a>").is_err());
    }

    #[test]
    fn test_xml_lang_attribute() {
        let root = Element::parse(r#"<m xml:lang="en">hi</m>"#).unwrap();
        assert_eq!(root.attr_ns(XML_NS, "lang"), Some("en"));
        assert_eq!(root.to_xml(), r#"<m xml:lang="en">hi</m>"#);
    }

    #[test]
    fn test_serialize_declares_namespaces_on_change() {
        let el = Element::new_ns("urn:a", "top")
            .with_child(Element::new_ns("urn:a", "inner").with_text("1 < 2"))
            .with_child(Element::new_ns("urn:b", "other"))
            .with_child(Element::new("bare"));

        assert_eq!(
            el.to_xml(),
            r#"<top xmlns="urn:a"><inner>1 &lt; 2</inner><other xmlns="urn:b"/><bare xmlns=""/></top>"#
        );

        let reparsed = Element::parse(&el.to_pretty_xml()).unwrap();
        assert_eq!(reparsed, el);
    }

    #[test]
    fn test_namespaced_attribute_roundtrip() {
        let el = Element::new("a").with_attribute(Attribute::with_ns("urn:x", "k", "v"));
        let reparsed = Element::parse(&el.to_xml()).unwrap();
        assert_eq!(reparsed.attr_ns("urn:x", "k"), Some("v"));
    }

    #[test]
    fn test_pretty_output_is_indented() {
        let el = Element::new("a").with_child(Element::new("b").with_child(Element::new("c")));
        assert_eq!(el.to_pretty_xml(), "<a>\n  <b>\n    <c/>\n  </b>\n</a>");
    }

    #[test]
    fn test_find_path() {
        let root = Element::parse("<a><b><c>v</c></b></a>").unwrap();
        assert_eq!(root.find(&["b", "c"]).unwrap().text(), "v");
        assert!(root.find(&["b", "x"]).is_none());
    }
}
