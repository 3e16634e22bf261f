//! # netconf-protocol
//!
//! Wire protocol for NETCONF (RFC 6241, RFC 6242).
//!
//! This crate provides:
//! - A namespaced XML element model with parser and serializer
//! - End-of-message (base:1.0) and chunked (base:1.1) framing
//! - The `rpc-error` model and error tags
//! - Hello, rpc-reply, and notification envelopes

pub mod codec;
pub mod error;
pub mod framing;
pub mod message;
pub mod xml;

pub use codec::{MessageReader, MessageWriter};
pub use error::{ErrorInfo, ErrorSeverity, ErrorTag, ErrorType, ProtocolError, RpcError};
pub use framing::{ChunkedDecoder, ChunkedEncoder, EomDecoder, Framing};
pub use message::{build_reply, Hello, ReplyContent};
pub use xml::{Attribute, Element, XmlError};

/// NETCONF base namespace.
pub const BASE_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

/// Namespace of the `<notification>` envelope (RFC 5277).
pub const NOTIFICATION_NS: &str = "urn:ietf:params:xml:ns:netconf:notification:1.0";

/// Namespace of the `replayComplete` and `notificationComplete` markers.
pub const NETMOD_NOTIFICATION_NS: &str = "urn:ietf:params:xml:ns:netmod:notification";

/// IANA port for NETCONF over SSH (RFC 6242 §3).
pub const NETCONF_SSH_PORT: u16 = 830;

/// Default listen port. The server speaks NETCONF over plain TCP and leaves
/// SSH to a fronting proxy, so it stays off the privileged SSH port.
pub const DEFAULT_PORT: u16 = 8300;
