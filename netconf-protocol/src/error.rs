//! Protocol error types and the NETCONF `rpc-error` model.

use crate::xml::{Attribute, Element, XmlError, XML_NS};
use crate::BASE_NS;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur while framing, unframing, or validating messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("XML error: {0}")]
    Xml(#[from] XmlError),

    #[error("unexpected root element <{found}>, expected one of {expected:?}")]
    UnexpectedRoot { found: String, expected: Vec<String> },

    #[error("element <{element}> is not in the NETCONF base namespace (found {found:?})")]
    WrongNamespace {
        element: String,
        found: Option<String>,
    },
}

impl ProtocolError {
    /// Returns whether the peer sent something unparseable, as opposed to a
    /// transport failure.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, ProtocolError::Io(_))
    }

    /// Converts to the `malformed-message` rpc-error sent back to the peer.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError::malformed_message(self.to_string())
    }
}

/// Stable error tags (RFC 6241 Appendix A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorTag {
    InUse,
    InvalidValue,
    TooBig,
    MissingAttribute,
    BadAttribute,
    UnknownAttribute,
    MissingElement,
    BadElement,
    UnknownElement,
    UnknownNamespace,
    AccessDenied,
    LockDenied,
    ResourceDenied,
    RollbackFailed,
    DataExists,
    DataMissing,
    OperationNotSupported,
    OperationFailed,
    PartialOperation,
    MalformedMessage,
}

impl ErrorTag {
    pub const ALL: [ErrorTag; 20] = [
        ErrorTag::InUse,
        ErrorTag::InvalidValue,
        ErrorTag::TooBig,
        ErrorTag::MissingAttribute,
        ErrorTag::BadAttribute,
        ErrorTag::UnknownAttribute,
        ErrorTag::MissingElement,
        ErrorTag::BadElement,
        ErrorTag::UnknownElement,
        ErrorTag::UnknownNamespace,
        ErrorTag::AccessDenied,
        ErrorTag::LockDenied,
        ErrorTag::ResourceDenied,
        ErrorTag::RollbackFailed,
        ErrorTag::DataExists,
        ErrorTag::DataMissing,
        ErrorTag::OperationNotSupported,
        ErrorTag::OperationFailed,
        ErrorTag::PartialOperation,
        ErrorTag::MalformedMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorTag::InUse => "in-use",
            ErrorTag::InvalidValue => "invalid-value",
            ErrorTag::TooBig => "too-big",
            ErrorTag::MissingAttribute => "missing-attribute",
            ErrorTag::BadAttribute => "bad-attribute",
            ErrorTag::UnknownAttribute => "unknown-attribute",
            ErrorTag::MissingElement => "missing-element",
            ErrorTag::BadElement => "bad-element",
            ErrorTag::UnknownElement => "unknown-element",
            ErrorTag::UnknownNamespace => "unknown-namespace",
            ErrorTag::AccessDenied => "access-denied",
            ErrorTag::LockDenied => "lock-denied",
            ErrorTag::ResourceDenied => "resource-denied",
            ErrorTag::RollbackFailed => "rollback-failed",
            ErrorTag::DataExists => "data-exists",
            ErrorTag::DataMissing => "data-missing",
            ErrorTag::OperationNotSupported => "operation-not-supported",
            ErrorTag::OperationFailed => "operation-failed",
            ErrorTag::PartialOperation => "partial-operation",
            ErrorTag::MalformedMessage => "malformed-message",
        }
    }

    /// The error type reported when the caller does not choose one.
    pub fn default_type(&self) -> ErrorType {
        match self {
            ErrorTag::MissingAttribute
            | ErrorTag::BadAttribute
            | ErrorTag::UnknownAttribute
            | ErrorTag::MissingElement
            | ErrorTag::BadElement
            | ErrorTag::UnknownElement
            | ErrorTag::MalformedMessage => ErrorType::Rpc,
            ErrorTag::InUse
            | ErrorTag::UnknownNamespace
            | ErrorTag::LockDenied
            | ErrorTag::OperationNotSupported => ErrorType::Protocol,
            _ => ErrorType::Application,
        }
    }
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorTag::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| format!("unknown error-tag '{}'", s))
    }
}

/// Protocol layer at which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Transport,
    Rpc,
    Protocol,
    Application,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Transport => "transport",
            ErrorType::Rpc => "rpc",
            ErrorType::Protocol => "protocol",
            ErrorType::Application => "application",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "transport" => Some(ErrorType::Transport),
            "rpc" => Some(ErrorType::Rpc),
            "protocol" => Some(ErrorType::Protocol),
            "application" => Some(ErrorType::Application),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSeverity {
    Error,
    Warning,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Error => "error",
            ErrorSeverity::Warning => "warning",
        }
    }
}

/// Content of `error-info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorInfo {
    Scalar(String),
    Structured(Vec<Element>),
}

/// Content of `error-path`, optionally carrying attributes such as prefix
/// declarations for the path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPath {
    pub path: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub text: String,
    pub lang: String,
}

/// A single NETCONF `rpc-error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub tag: ErrorTag,
    pub error_type: ErrorType,
    pub severity: ErrorSeverity,
    pub info: Option<ErrorInfo>,
    pub app_tag: Option<String>,
    pub path: Option<ErrorPath>,
    pub message: Option<ErrorMessage>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.tag, self.error_type.as_str())?;
        if let Some(ref message) = self.message {
            write!(f, ": {}", message.text)?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

fn info_element(name: &str, value: impl Into<String>) -> Element {
    Element::new_ns(BASE_NS, name).with_text(value)
}

impl RpcError {
    pub fn new(tag: ErrorTag) -> Self {
        Self {
            tag,
            error_type: tag.default_type(),
            severity: ErrorSeverity::Error,
            info: None,
            app_tag: None,
            path: None,
            message: None,
        }
    }

    pub fn with_type(mut self, error_type: ErrorType) -> Self {
        self.error_type = error_type;
        self
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_app_tag(mut self, app_tag: impl Into<String>) -> Self {
        self.app_tag = Some(app_tag.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(ErrorPath {
            path: path.into(),
            attributes: Vec::new(),
        });
        self
    }

    pub fn with_attributed_path(mut self, path: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        self.path = Some(ErrorPath {
            path: path.into(),
            attributes,
        });
        self
    }

    /// Sets the message in the default language (`en`).
    pub fn with_message(self, text: impl Into<String>) -> Self {
        self.with_message_lang(text, "en")
    }

    pub fn with_message_lang(mut self, text: impl Into<String>, lang: impl Into<String>) -> Self {
        self.message = Some(ErrorMessage {
            text: text.into(),
            lang: lang.into(),
        });
        self
    }

    pub fn with_info(mut self, info: ErrorInfo) -> Self {
        self.info = Some(info);
        self
    }

    fn with_info_elements(self, elements: Vec<Element>) -> Self {
        self.with_info(ErrorInfo::Structured(elements))
    }

    pub fn missing_attribute(attribute: &str, element: &str) -> Self {
        Self::new(ErrorTag::MissingAttribute)
            .with_info_elements(vec![
                info_element("bad-attribute", attribute),
                info_element("bad-element", element),
            ])
            .with_message(format!("missing attribute '{}' on <{}>", attribute, element))
    }

    pub fn bad_attribute(attribute: &str, element: &str) -> Self {
        Self::new(ErrorTag::BadAttribute).with_info_elements(vec![
            info_element("bad-attribute", attribute),
            info_element("bad-element", element),
        ])
    }

    pub fn unknown_attribute(attribute: &str, element: &str) -> Self {
        Self::new(ErrorTag::UnknownAttribute).with_info_elements(vec![
            info_element("bad-attribute", attribute),
            info_element("bad-element", element),
        ])
    }

    pub fn missing_element(element: &str) -> Self {
        Self::new(ErrorTag::MissingElement)
            .with_info_elements(vec![info_element("bad-element", element)])
            .with_message(format!("missing element <{}>", element))
    }

    pub fn bad_element(element: &str) -> Self {
        Self::new(ErrorTag::BadElement).with_info_elements(vec![info_element("bad-element", element)])
    }

    pub fn unknown_element(element: &str) -> Self {
        Self::new(ErrorTag::UnknownElement)
            .with_info_elements(vec![info_element("bad-element", element)])
    }

    pub fn unknown_namespace(namespace: &str, element: &str) -> Self {
        Self::new(ErrorTag::UnknownNamespace).with_info_elements(vec![
            info_element("bad-element", element),
            info_element("bad-namespace", namespace),
        ])
    }

    /// The lock is held by another session; the holder is reported in
    /// `error-info` so the client can decide whether to retry.
    pub fn lock_denied(holder: u32) -> Self {
        Self::new(ErrorTag::LockDenied)
            .with_info_elements(vec![info_element("session-id", holder.to_string())])
            .with_message(format!("lock is held by session {}", holder))
    }

    pub fn in_use(message: impl Into<String>) -> Self {
        Self::new(ErrorTag::InUse).with_message(message)
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ErrorTag::InvalidValue).with_message(message)
    }

    pub fn too_big(message: impl Into<String>) -> Self {
        Self::new(ErrorTag::TooBig).with_message(message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorTag::AccessDenied).with_message(message)
    }

    pub fn resource_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorTag::ResourceDenied).with_message(message)
    }

    pub fn data_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorTag::DataExists).with_message(message)
    }

    pub fn data_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorTag::DataMissing).with_message(message)
    }

    pub fn operation_not_supported(operation: &str) -> Self {
        Self::new(ErrorTag::OperationNotSupported)
            .with_message(format!("operation '{}' is not supported", operation))
    }

    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorTag::OperationFailed).with_message(message)
    }

    pub fn malformed_message(message: impl Into<String>) -> Self {
        Self::new(ErrorTag::MalformedMessage).with_message(message)
    }

    /// Returns the text of a structured `error-info` child, e.g. `session-id`.
    pub fn info_value(&self, name: &str) -> Option<&str> {
        match self.info {
            Some(ErrorInfo::Structured(ref elements)) => {
                elements.iter().find(|e| e.name == name).map(|e| e.text())
            }
            _ => None,
        }
    }

    /// Serializes to an `<rpc-error>` element.
    pub fn to_element(&self) -> Element {
        let mut el = Element::new_ns(BASE_NS, "rpc-error")
            .with_child(info_element("error-tag", self.tag.as_str()))
            .with_child(info_element("error-type", self.error_type.as_str()))
            .with_child(info_element("error-severity", self.severity.as_str()));

        match self.info {
            Some(ErrorInfo::Scalar(ref value)) => el.push(info_element("error-info", value.clone())),
            Some(ErrorInfo::Structured(ref elements)) => {
                el.push(Element::new_ns(BASE_NS, "error-info").with_children(elements.iter().cloned()))
            }
            None => {}
        }
        if let Some(ref app_tag) = self.app_tag {
            el.push(info_element("error-app-tag", app_tag.clone()));
        }
        if let Some(ref path) = self.path {
            let mut path_el = info_element("error-path", path.path.clone());
            path_el.attributes.extend(path.attributes.iter().cloned());
            el.push(path_el);
        }
        if let Some(ref message) = self.message {
            el.push(
                info_element("error-message", message.text.clone())
                    .with_attribute(Attribute::with_ns(XML_NS, "lang", message.lang.clone())),
            );
        }
        el
    }

    /// Parses an `<rpc-error>` element.
    pub fn from_element(el: &Element) -> Option<Self> {
        if el.name != "rpc-error" {
            return None;
        }
        let tag: ErrorTag = el.child("error-tag")?.text().parse().ok()?;
        let mut error = RpcError::new(tag);
        if let Some(t) = el.child("error-type").and_then(|e| ErrorType::parse(e.text())) {
            error.error_type = t;
        }
        if el.child("error-severity").map(|e| e.text()) == Some("warning") {
            error.severity = ErrorSeverity::Warning;
        }
        if let Some(info) = el.child("error-info") {
            error.info = Some(if info.has_children() {
                ErrorInfo::Structured(info.children.clone())
            } else {
                ErrorInfo::Scalar(info.text().to_string())
            });
        }
        error.app_tag = el.child("error-app-tag").map(|e| e.text().to_string());
        error.path = el.child("error-path").map(|e| ErrorPath {
            path: e.text().to_string(),
            attributes: e.attributes.clone(),
        });
        error.message = el.child("error-message").map(|e| ErrorMessage {
            text: e.text().to_string(),
            lang: e.attr_ns(XML_NS, "lang").unwrap_or("en").to_string(),
        });
        Some(error)
    }
}
