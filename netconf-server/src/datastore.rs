//! Datastore collaborator.
//!
//! The engine does not know what `get-config` or `edit-config` mean for a
//! device. It forwards those operations to a [`Datastore`], optionally
//! through a per-session [`DatastoreSession`] handle. [`MemoryDatastore`] is
//! a small in-memory implementation used by the `netconfd` binary and by
//! tests.

use crate::error::HandlerError;
use netconf_protocol::xml::Element;
use netconf_protocol::{RpcError, BASE_NS};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Result of an operation before it is wrapped in an `<rpc-reply>`.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutput {
    /// Replies with `<ok/>`.
    Ok,
    /// Serialized XML; parsed by the dispatcher.
    Xml(String),
    /// An element placed directly in the reply.
    Tree(Element),
}

/// Executes operations the engine does not implement itself.
pub trait Datastore: Send + Sync {
    /// Handles `operation`; `input` is the operation element of the `<rpc>`.
    fn handle(&self, operation: &str, input: &Element) -> Result<RpcOutput, HandlerError>;

    /// Opens a handle owned by one session for its lifetime. When `None`,
    /// the session calls [`Datastore::handle`] directly.
    fn open_session(&self, _session_id: u32) -> Option<Box<dyn DatastoreSession>> {
        None
    }
}

/// Session-scoped datastore handle.
pub trait DatastoreSession: Send {
    fn handle(&mut self, operation: &str, input: &Element) -> Result<RpcOutput, HandlerError>;

    /// Called once when the owning session closes.
    fn close(&mut self) {}
}

/// The configuration datastores of RFC 6241 §5.1 this store knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Running,
    Candidate,
}

impl Target {
    fn from_container(input: &Element, container: &str) -> Result<Self, RpcError> {
        let node = input
            .child(container)
            .ok_or_else(|| RpcError::missing_element(container))?;
        let name = node
            .children
            .first()
            .ok_or_else(|| RpcError::missing_element(container))?;
        match name.name.as_str() {
            "running" => Ok(Target::Running),
            "candidate" => Ok(Target::Candidate),
            other => Err(RpcError::invalid_value(format!("unsupported datastore '{}'", other))
                .with_path(format!("/rpc/{}/{}", input.name, container))),
        }
    }
}

/// Edit operation of an `edit-config` node (RFC 6241 §7.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditOp {
    Merge,
    Replace,
    Create,
    Delete,
    Remove,
    None,
}

impl EditOp {
    fn parse(value: &str, attribute: &str, element: &str) -> Result<Self, RpcError> {
        match value {
            "merge" => Ok(EditOp::Merge),
            "replace" => Ok(EditOp::Replace),
            "create" => Ok(EditOp::Create),
            "delete" => Ok(EditOp::Delete),
            "remove" => Ok(EditOp::Remove),
            "none" => Ok(EditOp::None),
            _ => Err(RpcError::bad_attribute(attribute, element)),
        }
    }
}

/// In-memory running and candidate configuration.
///
/// Entries are matched by name and namespace. Elements registered with
/// [`MemoryDatastore::with_list_key`] are list entries and additionally
/// matched on the text of their key leaf.
pub struct MemoryDatastore {
    running: RwLock<Element>,
    candidate: RwLock<Element>,
    list_keys: HashMap<String, String>,
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::with_config(&Element::new_ns(BASE_NS, "data"))
    }

    /// Creates a store whose running and candidate configuration are the
    /// children of `config` (typically a `<config>` or `<data>` element).
    pub fn with_config(config: &Element) -> Self {
        let data = Element::new_ns(BASE_NS, "data").with_children(config.children.iter().cloned());
        Self {
            running: RwLock::new(data.clone()),
            candidate: RwLock::new(data),
            list_keys: HashMap::new(),
        }
    }

    pub fn with_list_key(mut self, element: impl Into<String>, key: impl Into<String>) -> Self {
        self.list_keys.insert(element.into(), key.into());
        self
    }

    /// Returns a copy of the running configuration as `<data>`.
    pub fn running(&self) -> Element {
        self.running.read().clone()
    }

    /// Returns a copy of the candidate configuration as `<data>`.
    pub fn candidate(&self) -> Element {
        self.candidate.read().clone()
    }

    fn store(&self, target: Target) -> &RwLock<Element> {
        match target {
            Target::Running => &self.running,
            Target::Candidate => &self.candidate,
        }
    }

    fn get_config(&self, input: &Element) -> Result<RpcOutput, HandlerError> {
        let source = Target::from_container(input, "source")?;
        Ok(RpcOutput::Tree(self.store(source).read().clone()))
    }

    fn edit_config(&self, input: &Element) -> Result<RpcOutput, HandlerError> {
        let target = Target::from_container(input, "target")?;
        let default_op = match input.child("default-operation") {
            Some(op) => match op.text().trim() {
                "merge" => EditOp::Merge,
                "replace" => EditOp::Replace,
                "none" => EditOp::None,
                _ => return Err(RpcError::bad_element("default-operation").into()),
            },
            None => EditOp::Merge,
        };
        let config = input
            .child("config")
            .ok_or_else(|| RpcError::missing_element("config"))?;

        // Edits are applied to a copy so a failing node leaves the store untouched.
        let mut store = self.store(target).write();
        let mut edited = store.clone();
        if default_op == EditOp::Replace {
            edited.children.clear();
        }
        self.apply_edits(&mut edited, config, default_op)?;
        *store = edited;
        Ok(RpcOutput::Ok)
    }

    fn copy_config(&self, input: &Element) -> Result<RpcOutput, HandlerError> {
        let target = Target::from_container(input, "target")?;
        let source = input
            .child("source")
            .ok_or_else(|| RpcError::missing_element("source"))?;
        let contents = match source.child("config") {
            Some(config) => strip_operations(config).children,
            None => self.store(Target::from_container(input, "source")?).read().children.clone(),
        };
        self.store(target).write().children = contents;
        Ok(RpcOutput::Ok)
    }

    fn delete_config(&self, input: &Element) -> Result<RpcOutput, HandlerError> {
        match Target::from_container(input, "target")? {
            Target::Running => Err(RpcError::operation_failed("the running datastore cannot be deleted").into()),
            Target::Candidate => {
                self.candidate.write().children.clear();
                Ok(RpcOutput::Ok)
            }
        }
    }

    fn validate(&self, input: &Element) -> Result<RpcOutput, HandlerError> {
        let source = input
            .child("source")
            .ok_or_else(|| RpcError::missing_element("source"))?;
        if source.child("config").is_none() {
            Target::from_container(input, "source")?;
        }
        Ok(RpcOutput::Ok)
    }

    fn apply_edits(&self, target: &mut Element, edits: &Element, inherited: EditOp) -> Result<(), RpcError> {
        for edit in &edits.children {
            let op = match edit.attr_ns(BASE_NS, "operation") {
                Some(value) => EditOp::parse(value, "operation", &edit.name)?,
                None => inherited,
            };
            let existing = target.children.iter().position(|c| self.same_entry(c, edit));

            match (op, existing) {
                (EditOp::Merge, Some(i)) => {
                    if edit.has_children() {
                        self.apply_edits(&mut target.children[i], edit, EditOp::Merge)?;
                    } else {
                        target.children[i].text = edit.text.clone();
                    }
                }
                (EditOp::Merge | EditOp::Replace | EditOp::Create, None) => {
                    target.push(strip_operations(edit));
                }
                (EditOp::Replace, Some(i)) => target.children[i] = strip_operations(edit),
                (EditOp::Create, Some(_)) => {
                    return Err(RpcError::data_exists(format!("'{}' already exists", edit.name)));
                }
                (EditOp::Delete, None) => {
                    return Err(RpcError::data_missing(format!("'{}' does not exist", edit.name)));
                }
                (EditOp::Delete | EditOp::Remove, Some(i)) => {
                    target.children.remove(i);
                }
                (EditOp::Remove, None) => {}
                (EditOp::None, Some(i)) => {
                    self.apply_edits(&mut target.children[i], edit, EditOp::None)?;
                }
                (EditOp::None, None) => {
                    if edit.has_children() {
                        return Err(RpcError::data_missing(format!("'{}' does not exist", edit.name)));
                    }
                }
            }
        }
        Ok(())
    }

    fn same_entry(&self, existing: &Element, edit: &Element) -> bool {
        if existing.name != edit.name || existing.ns != edit.ns {
            return false;
        }
        match self.list_keys.get(&edit.name) {
            Some(key) => match (existing.child(key), edit.child(key)) {
                (Some(a), Some(b)) => a.text().trim() == b.text().trim(),
                _ => false,
            },
            None => true,
        }
    }
}

impl Datastore for MemoryDatastore {
    fn handle(&self, operation: &str, input: &Element) -> Result<RpcOutput, HandlerError> {
        match operation {
            "get" => Ok(RpcOutput::Tree(self.running.read().clone())),
            "get-config" => self.get_config(input),
            "edit-config" => self.edit_config(input),
            "copy-config" => self.copy_config(input),
            "delete-config" => self.delete_config(input),
            "commit" => {
                let candidate = self.candidate.read().clone();
                *self.running.write() = candidate;
                Ok(RpcOutput::Ok)
            }
            "discard-changes" => {
                let running = self.running.read().clone();
                *self.candidate.write() = running;
                Ok(RpcOutput::Ok)
            }
            "validate" => self.validate(input),
            other => Err(RpcError::operation_not_supported(other).into()),
        }
    }
}

fn strip_operations(el: &Element) -> Element {
    let mut out = el.shallow_clone();
    out.attributes
        .retain(|a| !(a.ns.as_deref() == Some(BASE_NS) && a.name == "operation"));
    out.children = el.children.iter().map(strip_operations).collect();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use netconf_protocol::ErrorTag;

    fn rpc_op(xml: &str) -> Element {
        Element::parse(xml).unwrap()
    }

    fn store() -> MemoryDatastore {
        let config = Element::parse(
            r#"<config xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                 <top xmlns="urn:example">
                   <users>
                     <user><name>fred</name><type>admin</type></user>
                   </users>
                   <hostname>r1</hostname>
                 </top>
               </config>"#,
        )
        .unwrap();
        MemoryDatastore::with_config(&config).with_list_key("user", "name")
    }

    fn rpc_err(result: Result<RpcOutput, HandlerError>) -> RpcError {
        match result {
            Err(HandlerError::Rpc(e)) => e,
            other => panic!("expected rpc error, got {:?}", other),
        }
    }

    #[test]
    fn test_get_config_running() {
        let ds = store();
        let out = ds
            .handle(
                "get-config",
                &rpc_op(r#"<get-config xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><source><running/></source></get-config>"#),
            )
            .unwrap();
        match out {
            RpcOutput::Tree(data) => {
                assert!(data.is(BASE_NS, "data"));
                assert_eq!(data.find(&["top", "hostname"]).unwrap().text(), "r1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_get_config_unknown_source() {
        let ds = store();
        let err = rpc_err(ds.handle(
            "get-config",
            &rpc_op(r#"<get-config xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><source><startup/></source></get-config>"#),
        ));
        assert_eq!(err.tag, ErrorTag::InvalidValue);

        let err = rpc_err(ds.handle("get-config", &rpc_op("<get-config/>")));
        assert_eq!(err.tag, ErrorTag::MissingElement);
    }

    #[test]
    fn test_edit_config_merge_adds_list_entry() {
        let ds = store();
        ds.handle(
            "edit-config",
            &rpc_op(
                r#"<edit-config xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                     <target><running/></target>
                     <config>
                       <top xmlns="urn:example">
                         <users><user><name>barney</name><type>user</type></user></users>
                         <hostname>r2</hostname>
                       </top>
                     </config>
                   </edit-config>"#,
            ),
        )
        .unwrap();

        let running = ds.running();
        let users = running.find(&["top", "users"]).unwrap();
        assert_eq!(users.children.len(), 2);
        assert_eq!(running.find(&["top", "hostname"]).unwrap().text(), "r2");
        assert_eq!(running.children_named("top").count(), 1);
    }

    #[test]
    fn test_edit_config_create_and_delete() {
        let ds = store();
        let create = rpc_op(
            r#"<edit-config xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" xmlns:nc="urn:ietf:params:xml:ns:netconf:base:1.0">
                 <target><running/></target>
                 <config>
                   <top xmlns="urn:example"><users><user nc:operation="create"><name>fred</name></user></users></top>
                 </config>
               </edit-config>"#,
        );
        assert_eq!(rpc_err(ds.handle("edit-config", &create)).tag, ErrorTag::DataExists);

        let delete = rpc_op(
            r#"<edit-config xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" xmlns:nc="urn:ietf:params:xml:ns:netconf:base:1.0">
                 <target><running/></target>
                 <config>
                   <top xmlns="urn:example"><users><user nc:operation="delete"><name>fred</name></user></users></top>
                 </config>
               </edit-config>"#,
        );
        ds.handle("edit-config", &delete).unwrap();
        assert!(ds.running().find(&["top", "users"]).unwrap().children.is_empty());
        assert_eq!(rpc_err(ds.handle("edit-config", &delete)).tag, ErrorTag::DataMissing);
    }

    #[test]
    fn test_failed_edit_leaves_store_untouched() {
        let ds = store();
        let before = ds.running();
        let edit = rpc_op(
            r#"<edit-config xmlns="urn:ietf:params:xml:ns:netconf:base:1.0" xmlns:nc="urn:ietf:params:xml:ns:netconf:base:1.0">
                 <target><running/></target>
                 <config>
                   <top xmlns="urn:example">
                     <hostname>changed</hostname>
                     <users><user nc:operation="create"><name>fred</name></user></users>
                   </top>
                 </config>
               </edit-config>"#,
        );
        assert!(ds.handle("edit-config", &edit).is_err());
        assert_eq!(ds.running(), before);
    }

    #[test]
    fn test_candidate_commit_and_discard() {
        let ds = store();
        let edit = rpc_op(
            r#"<edit-config xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                 <target><candidate/></target>
                 <config><top xmlns="urn:example"><hostname>cand</hostname></top></config>
               </edit-config>"#,
        );
        ds.handle("edit-config", &edit).unwrap();
        assert_eq!(ds.running().find(&["top", "hostname"]).unwrap().text(), "r1");

        ds.handle("discard-changes", &Element::new("discard-changes")).unwrap();
        assert_eq!(ds.candidate().find(&["top", "hostname"]).unwrap().text(), "r1");

        ds.handle("edit-config", &edit).unwrap();
        ds.handle("commit", &Element::new("commit")).unwrap();
        assert_eq!(ds.running().find(&["top", "hostname"]).unwrap().text(), "cand");
    }

    #[test]
    fn test_copy_and_delete_config() {
        let ds = store();
        ds.handle(
            "copy-config",
            &rpc_op(
                r#"<copy-config xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
                     <target><candidate/></target>
                     <source><config><other xmlns="urn:example"/></config></source>
                   </copy-config>"#,
            ),
        )
        .unwrap();
        let candidate = ds.candidate();
        assert_eq!(candidate.children.len(), 1);
        assert_eq!(candidate.children[0].name, "other");

        let delete_running = rpc_op(
            r#"<delete-config xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><target><running/></target></delete-config>"#,
        );
        assert_eq!(rpc_err(ds.handle("delete-config", &delete_running)).tag, ErrorTag::OperationFailed);

        let delete_candidate = rpc_op(
            r#"<delete-config xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><target><candidate/></target></delete-config>"#,
        );
        ds.handle("delete-config", &delete_candidate).unwrap();
        assert!(ds.candidate().children.is_empty());
    }

    #[test]
    fn test_unknown_operation() {
        let ds = MemoryDatastore::new();
        let err = rpc_err(ds.handle("reboot", &Element::new("reboot")));
        assert_eq!(err.tag, ErrorTag::OperationNotSupported);
    }
}
