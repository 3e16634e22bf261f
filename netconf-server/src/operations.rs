//! Standard capability catalog and its operation handlers.

use crate::broadcast::DEFAULT_STREAM;
use crate::datastore::RpcOutput;
use crate::error::HandlerError;
use crate::handler::{OperationContext, OperationRegistry, OperationSpec, Teardown};
use chrono::{DateTime, Utc};
use netconf_core::{Capability, CapabilityError};
use netconf_protocol::message::parse_event_time;
use netconf_protocol::xml::Element;
use netconf_protocol::RpcError;

pub const BASE_1_0: &str = "urn:ietf:params:netconf:base:1.0";
pub const BASE_1_1: &str = "urn:ietf:params:netconf:base:1.1";
pub const WRITABLE_RUNNING: &str = "urn:ietf:params:netconf:capability:writable-running:1.0";
pub const CANDIDATE: &str = "urn:ietf:params:netconf:capability:candidate:1.0";
pub const VALIDATE: &str = "urn:ietf:params:netconf:capability:validate:1.1";
pub const XPATH: &str = "urn:ietf:params:netconf:capability:xpath:1.0";
pub const NOTIFICATION: &str = "urn:ietf:params:netconf:capability:notification:1.0";
pub const INTERLEAVE: &str = "urn:ietf:params:netconf:capability:interleave:1.0";

const BASE_KEYWORD: &str = netconf_core::BASE_KEYWORD;
const NOTIFICATION_KEYWORD: &str = "urn:ietf:params:netconf:capability:notification";

/// Builds the standard catalog. `features` limits which gated
/// capabilities are enabled; `None` enables all of them.
pub fn standard_registry(features: Option<&[String]>) -> Result<OperationRegistry, CapabilityError> {
    let mut registry = OperationRegistry::new();
    if let Some(features) = features {
        registry = registry.with_features(features.iter().cloned());
    }
    for capability in standard_capabilities()? {
        registry.register(capability);
    }
    Ok(registry)
}

/// The capabilities of RFC 6241 §8 and RFC 5277 with their operations.
pub fn standard_capabilities() -> Result<Vec<Capability<OperationSpec>>, CapabilityError> {
    Ok(vec![
        base(BASE_1_0)?,
        base(BASE_1_1)?,
        Capability::new(WRITABLE_RUNNING)?
            .with_feature("writable-running")
            .with_dependency(BASE_KEYWORD),
        Capability::new(CANDIDATE)?
            .with_feature("candidate")
            .with_dependency(BASE_KEYWORD)
            .with_operation("commit", OperationSpec::new(forward))
            .with_operation("discard-changes", OperationSpec::new(forward)),
        Capability::new(VALIDATE)?
            .with_feature("validate")
            .with_dependency(BASE_KEYWORD)
            .with_operation("validate", OperationSpec::new(forward)),
        Capability::new(XPATH)?
            .with_feature("xpath")
            .with_dependency(BASE_KEYWORD),
        Capability::new(NOTIFICATION)?
            .with_feature("notification")
            .with_dependency(BASE_KEYWORD)
            .with_operation("create-subscription", OperationSpec::new(create_subscription)),
        Capability::new(INTERLEAVE)?
            .with_feature("interleave")
            .with_dependency(NOTIFICATION_KEYWORD),
    ])
}

fn base(id: &str) -> Result<Capability<OperationSpec>, CapabilityError> {
    Ok(Capability::new(id)?
        .with_operation("get", OperationSpec::new(forward).with_filter())
        .with_operation("get-config", OperationSpec::new(forward).with_filter())
        .with_operation("edit-config", OperationSpec::new(write_config))
        .with_operation("copy-config", OperationSpec::new(write_config))
        .with_operation("delete-config", OperationSpec::new(write_config))
        .with_operation("lock", OperationSpec::new(lock))
        .with_operation("unlock", OperationSpec::new(unlock))
        .with_operation("close-session", OperationSpec::new(close_session))
        .with_operation("kill-session", OperationSpec::new(kill_session)))
}

fn forward(ctx: &mut OperationContext<'_>, input: &Element) -> Result<RpcOutput, HandlerError> {
    ctx.datastore(&input.name, input)
}

/// Name of the first child of `<container>`, e.g. `running` in
/// `<target><running/></target>`.
fn datastore_name<'a>(input: &'a Element, container: &str) -> Result<&'a str, RpcError> {
    input
        .child(container)
        .and_then(|c| c.children.first())
        .map(|name| name.name.as_str())
        .ok_or_else(|| RpcError::missing_element(container))
}

fn write_config(ctx: &mut OperationContext<'_>, input: &Element) -> Result<RpcOutput, HandlerError> {
    let target = datastore_name(input, "target")?;
    let required = match target {
        "running" => Some(WRITABLE_RUNNING),
        "candidate" => Some(CANDIDATE),
        _ => None,
    };
    if let Some(required) = required {
        if input.name != "delete-config" && ctx.negotiated.get(required).is_none() {
            return Err(RpcError::operation_not_supported(&input.name)
                .with_message(format!("writing to '{}' requires {}", target, required))
                .into());
        }
    }
    if let Some(holder) = ctx.server.lock_holder(target) {
        if holder != ctx.session_id() {
            return Err(RpcError::in_use(format!("'{}' is locked by session {}", target, holder)).into());
        }
    }
    ctx.datastore(&input.name, input)
}

fn lock(ctx: &mut OperationContext<'_>, input: &Element) -> Result<RpcOutput, HandlerError> {
    let target = datastore_name(input, "target")?;
    ctx.server.lock(target, ctx.session_id())?;
    Ok(RpcOutput::Ok)
}

fn unlock(ctx: &mut OperationContext<'_>, input: &Element) -> Result<RpcOutput, HandlerError> {
    let target = datastore_name(input, "target")?;
    ctx.server.unlock(target, ctx.session_id())?;
    Ok(RpcOutput::Ok)
}

fn close_session(ctx: &mut OperationContext<'_>, _input: &Element) -> Result<RpcOutput, HandlerError> {
    ctx.request_teardown(Teardown::Own);
    Ok(RpcOutput::Ok)
}

fn kill_session(ctx: &mut OperationContext<'_>, input: &Element) -> Result<RpcOutput, HandlerError> {
    let value = input
        .child("session-id")
        .ok_or_else(|| RpcError::missing_element("session-id"))?
        .text()
        .trim();
    let id: u32 = value
        .parse()
        .map_err(|_| RpcError::invalid_value(format!("invalid session-id '{}'", value)))?;
    if id == ctx.session_id() {
        return Err(RpcError::invalid_value("a session cannot kill itself; use close-session").into());
    }
    if ctx.server.session(id).is_none() {
        return Err(RpcError::invalid_value(format!("no session {}", id)).into());
    }
    ctx.request_teardown(Teardown::Session(id));
    Ok(RpcOutput::Ok)
}

fn parse_time(input: &Element, name: &str) -> Result<Option<DateTime<Utc>>, RpcError> {
    match input.child(name) {
        Some(el) => parse_event_time(el.text())
            .map(Some)
            .map_err(|_| RpcError::bad_element(name)),
        None => Ok(None),
    }
}

fn create_subscription(ctx: &mut OperationContext<'_>, input: &Element) -> Result<RpcOutput, HandlerError> {
    let stream = input
        .child("stream")
        .map(|s| s.text().trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_STREAM);
    let start = parse_time(input, "startTime")?;
    let stop = parse_time(input, "stopTime")?;

    match (start, stop) {
        (None, Some(_)) => return Err(RpcError::bad_element("stopTime").into()),
        (Some(start), _) if start > Utc::now() => return Err(RpcError::bad_element("startTime").into()),
        (Some(start), Some(stop)) if stop < start => return Err(RpcError::bad_element("stopTime").into()),
        _ => {}
    }

    ctx.session.create_subscription(ctx.server, stream, start, stop)?;
    Ok(RpcOutput::Ok)
}
