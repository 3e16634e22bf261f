//! NETCONF message envelopes: hello, rpc-reply, and notification.

use crate::error::{ProtocolError, RpcError};
use crate::xml::{Attribute, Element};
use crate::{BASE_NS, NETMOD_NOTIFICATION_NS, NOTIFICATION_NS};
use chrono::{DateTime, SecondsFormat, Utc};

/// A `<hello>` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub capabilities: Vec<String>,
    /// Present only in the server's hello.
    pub session_id: Option<u32>,
}

impl Hello {
    pub fn new(capabilities: Vec<String>) -> Self {
        Self {
            capabilities,
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: u32) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn to_element(&self) -> Element {
        let capabilities = Element::new_ns(BASE_NS, "capabilities").with_children(
            self.capabilities
                .iter()
                .map(|c| Element::new_ns(BASE_NS, "capability").with_text(c.clone())),
        );
        let mut hello = Element::new_ns(BASE_NS, "hello").with_child(capabilities);
        if let Some(id) = self.session_id {
            hello.push(Element::new_ns(BASE_NS, "session-id").with_text(id.to_string()));
        }
        hello
    }

    pub fn from_element(el: &Element) -> Result<Self, ProtocolError> {
        validate_root(el, &["hello"])?;
        let capabilities = el
            .child_ns(BASE_NS, "capabilities")
            .ok_or_else(|| ProtocolError::Malformed("hello without <capabilities>".into()))?
            .children
            .iter()
            .filter(|c| c.is(BASE_NS, "capability"))
            .map(|c| c.text().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let session_id = match el.child_ns(BASE_NS, "session-id") {
            Some(id) => Some(id.text().parse::<u32>().map_err(|_| {
                ProtocolError::Malformed(format!("invalid session-id '{}'", id.text()))
            })?),
            None => None,
        };
        Ok(Self {
            capabilities,
            session_id,
        })
    }
}

/// Checks that a received message root is one of `expected` in the base
/// namespace.
pub fn validate_root(el: &Element, expected: &[&str]) -> Result<(), ProtocolError> {
    if !expected.contains(&el.name.as_str()) {
        return Err(ProtocolError::UnexpectedRoot {
            found: el.name.clone(),
            expected: expected.iter().map(|s| s.to_string()).collect(),
        });
    }
    if el.ns.as_deref() != Some(BASE_NS) {
        return Err(ProtocolError::WrongNamespace {
            element: el.name.clone(),
            found: el.ns.clone(),
        });
    }
    Ok(())
}

/// Body of an `<rpc-reply>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyContent {
    Ok,
    Data(Element),
    Errors(Vec<RpcError>),
}

/// Builds an `<rpc-reply>` echoing the attributes of the request `<rpc>`.
pub fn build_reply(request_attributes: &[Attribute], content: ReplyContent) -> Element {
    let mut reply = Element::new_ns(BASE_NS, "rpc-reply");
    reply.attributes = request_attributes.to_vec();
    match content {
        ReplyContent::Ok => reply.push(Element::new_ns(BASE_NS, "ok")),
        ReplyContent::Data(data) => reply.push(data),
        ReplyContent::Errors(errors) => {
            for error in errors {
                reply.push(error.to_element());
            }
        }
    }
    reply
}

/// Renders a timestamp as canonical RFC 3339 UTC, e.g. `2024-05-01T10:00:00Z`
/// or `2024-05-01T10:00:00.250Z`.
pub fn format_event_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parses an RFC 3339 timestamp with any offset into UTC.
pub fn parse_event_time(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value.trim()).map(|t| t.with_timezone(&Utc))
}

/// Builds a `<notification>` carrying `body`.
pub fn notification(event_time: &DateTime<Utc>, body: Element) -> Element {
    Element::new_ns(NOTIFICATION_NS, "notification")
        .with_child(Element::new_ns(NOTIFICATION_NS, "eventTime").with_text(format_event_time(event_time)))
        .with_child(body)
}

/// Marks the end of replayed events for a subscription.
pub fn replay_complete(event_time: &DateTime<Utc>) -> Element {
    notification(event_time, Element::new_ns(NETMOD_NOTIFICATION_NS, "replayComplete"))
}

/// Marks the end of a subscription once its stop time has passed.
pub fn notification_complete(event_time: &DateTime<Utc>) -> Element {
    notification(
        event_time,
        Element::new_ns(NETMOD_NOTIFICATION_NS, "notificationComplete"),
    )
}
