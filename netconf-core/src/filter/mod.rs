//! Result filtering for get-family operations (RFC 6241 §6, §8.9).
//!
//! Both filter kinds work in two phases. Matching walks the raw output and
//! records which nodes are selected, addressed by their child-index path
//! from the output root. Rendering then walks the raw output once and copies
//! what was selected. Because every output node is visited once, a node
//! selected through several filter branches appears once, with the union of
//! its selected children.

mod subtree;
mod xpath;

pub use xpath::XPath;

use netconf_protocol::xml::Element;
use netconf_protocol::RpcError;
use std::collections::{HashMap, HashSet};

/// A parsed `<filter>`.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Structural filter; the element is the `<filter>` itself.
    Subtree(Element),
    /// XPath filter with the prefix bindings in scope at the `<filter>`.
    XPath {
        select: String,
        namespaces: Vec<(String, String)>,
    },
}

impl Filter {
    /// Parses a `<filter>` element.
    ///
    /// `inherited` holds prefix bindings declared on its ancestors
    /// (outermost first); bindings on the filter itself take precedence.
    pub fn from_element(filter: &Element, inherited: &[(String, String)]) -> Result<Self, RpcError> {
        match filter.attr("type").unwrap_or("subtree") {
            "subtree" => Ok(Filter::Subtree(filter.clone())),
            "xpath" => {
                let select = filter
                    .attr("select")
                    .ok_or_else(|| RpcError::missing_attribute("select", "filter"))?;
                let mut namespaces = inherited.to_vec();
                namespaces.extend(filter.ns_decls.iter().cloned());
                Ok(Filter::XPath {
                    select: select.to_string(),
                    namespaces,
                })
            }
            _ => Err(RpcError::bad_attribute("type", "filter")),
        }
    }

    pub fn is_xpath(&self) -> bool {
        matches!(self, Filter::XPath { .. })
    }

    /// Applies the filter to `output`, the container element returned by an
    /// operation (for example `<data>`). The container itself is always
    /// kept; filtering applies to its contents.
    pub fn apply(&self, output: &Element) -> Result<Element, RpcError> {
        let mut selection = Selection::default();
        match self {
            Filter::Subtree(filter) => subtree::select(filter, output, &mut selection),
            Filter::XPath { select, namespaces } => {
                let expr = XPath::parse(select, namespaces)?;
                for path in expr.select(output)? {
                    selection.mark(path, Mark::Full);
                }
            }
        }
        Ok(selection.render(output))
    }
}

/// Applies an optional filter, passing output through when there is none.
pub fn apply(output: Element, filter: Option<&Filter>) -> Result<Element, RpcError> {
    match filter {
        Some(filter) => filter.apply(&output),
        None => Ok(output),
    }
}

/// How much of a selected node is copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mark {
    /// The element and its attributes; content only where selected below.
    Partial,
    /// The element and its whole subtree.
    Full,
}

/// Selected nodes, keyed by child-index path from the output root.
#[derive(Debug, Default)]
pub(crate) struct Selection {
    marks: HashMap<Vec<usize>, Mark>,
    ancestors: HashSet<Vec<usize>>,
}

impl Selection {
    pub(crate) fn mark(&mut self, path: Vec<usize>, mark: Mark) {
        for depth in 0..path.len() {
            self.ancestors.insert(path[..depth].to_vec());
        }
        let entry = self.marks.entry(path).or_insert(mark);
        if mark == Mark::Full {
            *entry = Mark::Full;
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    fn render(&self, root: &Element) -> Element {
        if self.marks.get(&Vec::new()) == Some(&Mark::Full) {
            return root.clone();
        }
        let mut path = Vec::new();
        self.render_into(root, &mut path)
    }

    fn render_into(&self, source: &Element, path: &mut Vec<usize>) -> Element {
        let mut out = source.shallow_clone();
        for (i, child) in source.children.iter().enumerate() {
            path.push(i);
            match self.marks.get(path.as_slice()) {
                Some(Mark::Full) => out.push(child.clone()),
                Some(Mark::Partial) => out.push(self.render_into(child, path)),
                None if self.ancestors.contains(path.as_slice()) => {
                    out.push(self.render_into(child, path))
                }
                None => {}
            }
            path.pop();
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use netconf_protocol::{ErrorTag, BASE_NS};

    pub(crate) const USERS: &str = r#"
        <data xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
          <top xmlns="http://example.com/schema/1.2/config">
            <users>
              <user>
                <name>root</name>
                <type>superuser</type>
                <full-name>Charlie Root</full-name>
                <company-info>
                  <dept>1</dept>
                  <id>1</id>
                </company-info>
              </user>
              <user>
                <name>fred</name>
                <type>admin</type>
                <full-name>Fred Flintstone</full-name>
                <company-info>
                  <dept>2</dept>
                  <id>2</id>
                </company-info>
              </user>
              <user>
                <name>barney</name>
                <type>admin</type>
                <full-name>Barney Rubble</full-name>
                <company-info>
                  <dept>2</dept>
                  <id>3</id>
                </company-info>
              </user>
            </users>
          </top>
        </data>"#;

    pub(crate) fn users() -> Element {
        Element::parse(USERS).unwrap()
    }

    pub(crate) fn filter(xml: &str) -> Filter {
        let el = Element::parse(xml).unwrap();
        Filter::from_element(&el, &[]).unwrap()
    }

    #[test]
    fn test_filter_type_defaults_to_subtree() {
        let f = filter(r#"<filter xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><top/></filter>"#);
        assert!(matches!(f, Filter::Subtree(_)));
        assert!(!f.is_xpath());
    }

    #[test]
    fn test_unknown_filter_type() {
        let el = Element::new_ns(BASE_NS, "filter").with_attr("type", "regex");
        let err = Filter::from_element(&el, &[]).unwrap_err();
        assert_eq!(err.tag, ErrorTag::BadAttribute);
    }

    #[test]
    fn test_xpath_requires_select() {
        let el = Element::new_ns(BASE_NS, "filter").with_attr("type", "xpath");
        let err = Filter::from_element(&el, &[]).unwrap_err();
        assert_eq!(err.tag, ErrorTag::MissingAttribute);
        assert_eq!(err.info_value("bad-attribute"), Some("select"));
    }

    #[test]
    fn test_xpath_namespace_scope() {
        let el = Element::parse(
            r#"<filter xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" xmlns:t="urn:inner" type="xpath" select="/t:top"/>"#,
        )
        .unwrap();
        let inherited = vec![("t".to_string(), "urn:outer".to_string())];
        match Filter::from_element(&el, &inherited).unwrap() {
            Filter::XPath { select, namespaces } => {
                assert_eq!(select, "/t:top");
                assert_eq!(namespaces.last().unwrap(), &("t".to_string(), "urn:inner".to_string()));
            }
            other => panic!("unexpected filter {:?}", other),
        }
    }

    #[test]
    fn test_no_filter_passes_through() {
        let data = users();
        assert_eq!(apply(data.clone(), None).unwrap(), data);
    }

    #[test]
    fn test_selection_full_dominates_and_dedups() {
        let data = users();
        let mut sel = Selection::default();
        sel.mark(vec![0, 0, 1], Mark::Partial);
        sel.mark(vec![0, 0, 1], Mark::Full);
        sel.mark(vec![0, 0, 1], Mark::Partial);
        let out = sel.render(&data);
        let users = out.find(&["top", "users"]).unwrap();
        assert_eq!(users.children.len(), 1);
        assert_eq!(users.children[0].child("name").unwrap().text(), "fred");
        assert_eq!(users.children[0].children.len(), 4);
    }
}
