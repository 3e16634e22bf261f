//! Subtree filtering (RFC 6241 §6).
//!
//! Filter nodes are classified per sibling set:
//!
//! - selection node: empty leaf, selects the matching output node and its
//!   whole subtree
//! - content match node: leaf with text, matches output leaves with equal
//!   text; all content match siblings must match for the parent to be
//!   selected
//! - containment node: has child filter nodes, recursed into
//!
//! A filter node without a namespace (or in the NETCONF base namespace,
//! which it inherits from `<rpc>` when no other default is declared)
//! matches output nodes in any namespace.

use super::{Mark, Selection};
use netconf_protocol::xml::Element;
use netconf_protocol::BASE_NS;

type Marks = Vec<(Vec<usize>, Mark)>;

enum Outcome {
    /// A content match failed; the candidate is not selected.
    Rejected,
    /// Only content match nodes, all matched; the whole candidate is selected.
    Whole,
    /// Selection went through; the flag says whether anything was selected.
    Selected(bool),
}

/// Selects the parts of `output` that the children of `filter` match.
pub(super) fn select(filter: &Element, output: &Element, selection: &mut Selection) {
    let mut marks = Marks::new();
    let mut path = Vec::new();
    match match_children(filter, output, &mut path, &mut marks) {
        Outcome::Whole => selection.mark(Vec::new(), Mark::Full),
        Outcome::Selected(true) => {
            for (path, mark) in marks {
                selection.mark(path, mark);
            }
        }
        Outcome::Selected(false) | Outcome::Rejected => {}
    }
    if selection.is_empty() {
        tracing::debug!("subtree filter selected nothing");
    }
}

fn is_selection(node: &Element) -> bool {
    !node.has_children() && node.text().is_empty()
}

fn is_content_match(node: &Element) -> bool {
    !node.has_children() && !node.text().is_empty()
}

fn name_matches(filter: &Element, candidate: &Element) -> bool {
    if filter.name != candidate.name {
        return false;
    }
    match filter.ns.as_deref() {
        None | Some(BASE_NS) => true,
        Some(ns) => candidate.ns.as_deref() == Some(ns),
    }
}

fn attributes_match(filter: &Element, candidate: &Element) -> bool {
    filter.attributes.iter().all(|wanted| {
        candidate
            .attributes
            .iter()
            .any(|a| a.ns == wanted.ns && a.name == wanted.name && a.value == wanted.value)
    })
}

fn node_matches(filter: &Element, candidate: &Element) -> bool {
    name_matches(filter, candidate) && attributes_match(filter, candidate)
}

fn match_children(filter: &Element, candidate: &Element, path: &mut Vec<usize>, marks: &mut Marks) -> Outcome {
    let (content, structural): (Vec<&Element>, Vec<&Element>) =
        filter.children.iter().partition(|f| is_content_match(f));

    let mut content_hits = Vec::new();
    for wanted in &content {
        let hits: Vec<usize> = candidate
            .children
            .iter()
            .enumerate()
            .filter(|(_, c)| node_matches(wanted, c) && c.text() == wanted.text())
            .map(|(i, _)| i)
            .collect();
        if hits.is_empty() {
            return Outcome::Rejected;
        }
        content_hits.extend(hits);
    }

    if structural.is_empty() && !content.is_empty() {
        return Outcome::Whole;
    }

    for i in content_hits {
        path.push(i);
        marks.push((path.clone(), Mark::Full));
        path.pop();
    }

    let mut selected = false;
    for wanted in structural {
        for (i, child) in candidate.children.iter().enumerate() {
            if !node_matches(wanted, child) {
                continue;
            }
            path.push(i);
            if is_selection(wanted) {
                marks.push((path.clone(), Mark::Full));
                selected = true;
            } else {
                let mut nested = Marks::new();
                match match_children(wanted, child, path, &mut nested) {
                    Outcome::Whole => {
                        marks.push((path.clone(), Mark::Full));
                        selected = true;
                    }
                    Outcome::Selected(true) => {
                        marks.push((path.clone(), Mark::Partial));
                        marks.extend(nested);
                        selected = true;
                    }
                    Outcome::Selected(false) | Outcome::Rejected => {}
                }
            }
            path.pop();
        }
    }

    Outcome::Selected(selected || !content.is_empty())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{filter, users};
    use super::super::Filter;
    use netconf_protocol::xml::Element;

    fn run(filter_xml: &str) -> Element {
        filter(filter_xml).apply(&users()).unwrap()
    }

    #[test]
    fn test_selection_nodes_per_user() {
        let out = run(
            r#"<filter xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" type="subtree">
                 <top xmlns="http://example.com/schema/1.2/config">
                   <users><user><name/></user></users>
                 </top>
               </filter>"#,
        );
        let users = out.find(&["top", "users"]).unwrap();
        assert_eq!(users.children.len(), 3);
        let names: Vec<&str> = users
            .children
            .iter()
            .map(|u| {
                assert_eq!(u.children.len(), 1);
                u.child("name").unwrap().text()
            })
            .collect();
        assert_eq!(names, vec!["root", "fred", "barney"]);
    }

    #[test]
    fn test_content_match_returns_whole_entry() {
        let out = run(
            r#"<filter xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                 <top xmlns="http://example.com/schema/1.2/config">
                   <users><user><name>fred</name></user></users>
                 </top>
               </filter>"#,
        );
        let users = out.find(&["top", "users"]).unwrap();
        assert_eq!(users.children.len(), 1);
        let fred = &users.children[0];
        assert_eq!(fred.child("name").unwrap().text(), "fred");
        assert_eq!(fred.child("company-info").unwrap().child("id").unwrap().text(), "2");
    }

    #[test]
    fn test_content_match_with_selection_sibling() {
        let out = run(
            r#"<filter xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                 <top xmlns="http://example.com/schema/1.2/config">
                   <users><user><name>fred</name><type/><missing/></user></users>
                 </top>
               </filter>"#,
        );
        let fred = out.find(&["top", "users", "user"]).unwrap();
        let children: Vec<&str> = fred.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(children, vec!["name", "type"]);
    }

    #[test]
    fn test_content_match_siblings_all_must_match() {
        let data = Element::parse(
            r#"<data xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                 <parent xmlns="urn:example">
                   <child><name>foo</name><value>1</value><extra>a</extra></child>
                   <child><name>hoge</name><value>1</value><extra>b</extra></child>
                 </parent>
               </data>"#,
        )
        .unwrap();

        let one = Filter::Subtree(
            Element::parse(
                r#"<filter xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                     <parent xmlns="urn:example"><child><name>foo</name></child></parent>
                   </filter>"#,
            )
            .unwrap(),
        );
        let out = one.apply(&data).unwrap();
        let parent = out.child("parent").unwrap();
        assert_eq!(parent.children.len(), 1);
        assert_eq!(parent.children[0].child("name").unwrap().text(), "foo");
        assert_eq!(parent.children[0].child("extra").unwrap().text(), "a");

        let both = Filter::Subtree(
            Element::parse(
                r#"<filter xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                     <parent xmlns="urn:example"><child><name>hoge</name><value>2</value></child></parent>
                   </filter>"#,
            )
            .unwrap(),
        );
        let out = both.apply(&data).unwrap();
        assert!(out.children.is_empty());
    }

    #[test]
    fn test_namespace_mismatch_selects_nothing() {
        let out = run(
            r#"<filter xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                 <top xmlns="urn:other"/>
               </filter>"#,
        );
        assert!(out.children.is_empty());
        assert_eq!(out.name, "data");
    }

    #[test]
    fn test_unqualified_filter_matches_any_namespace() {
        let f = Filter::Subtree(
            Element::new("filter").with_child(Element::new("top").with_child(Element::new("users"))),
        );
        let out = f.apply(&users()).unwrap();
        assert_eq!(out.find(&["top", "users"]).unwrap().children.len(), 3);
    }

    #[test]
    fn test_attribute_match() {
        let data = Element::parse(
            r#"<data xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                 <interfaces xmlns="urn:example">
                   <interface ifName="eth0"><mtu>1500</mtu></interface>
                   <interface ifName="eth1"><mtu>9000</mtu></interface>
                 </interfaces>
               </data>"#,
        )
        .unwrap();
        let f = Filter::Subtree(
            Element::parse(
                r#"<filter xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                     <interfaces xmlns="urn:example"><interface ifName="eth1"/></interfaces>
                   </filter>"#,
            )
            .unwrap(),
        );
        let out = f.apply(&data).unwrap();
        let interfaces = out.child("interfaces").unwrap();
        assert_eq!(interfaces.children.len(), 1);
        assert_eq!(interfaces.children[0].attr("ifName"), Some("eth1"));
        assert_eq!(interfaces.children[0].child("mtu").unwrap().text(), "9000");
    }

    #[test]
    fn test_empty_containment_is_omitted() {
        let out = run(
            r#"<filter xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                 <top xmlns="http://example.com/schema/1.2/config">
                   <users><user><nickname/></user></users>
                 </top>
               </filter>"#,
        );
        assert!(out.children.is_empty());
    }

    #[test]
    fn test_overlapping_branches_are_merged() {
        let out = run(
            r#"<filter xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                 <top xmlns="http://example.com/schema/1.2/config">
                   <users><user><name/></user></users>
                   <users><user><type/></user></users>
                 </top>
               </filter>"#,
        );
        let tops: Vec<&Element> = out.children_named("top").collect();
        assert_eq!(tops.len(), 1);
        let users = tops[0].child("users").unwrap();
        assert_eq!(users.children.len(), 3);
        for user in &users.children {
            let names: Vec<&str> = user.children.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names, vec!["name", "type"]);
        }
    }
}
