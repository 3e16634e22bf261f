//! # netconf-server
//!
//! NETCONF server engine.
//!
//! This crate provides:
//! - Session lifecycle over any async byte stream: hello exchange,
//!   capability negotiation, and framing selection
//! - RPC dispatch to operations registered on capabilities
//! - Datastore locking and session termination
//! - Event notification streams with replay
//! - In-memory datastore
//! - YAML configuration and Prometheus metrics

pub mod broadcast;
pub mod config;
pub mod datastore;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod operations;
pub mod server;
pub mod session;

pub use broadcast::{NotificationEvent, StreamRegistry, DEFAULT_STREAM};
pub use config::Config;
pub use datastore::{Datastore, DatastoreSession, MemoryDatastore, RpcOutput};
pub use error::{HandlerError, ServerError};
pub use handler::{Dispatcher, OperationContext, OperationRegistry, OperationSpec, Teardown};
pub use metrics::Metrics;
pub use operations::standard_registry;
pub use server::{Server, ServerConfig};
pub use session::{Session, SessionState};
