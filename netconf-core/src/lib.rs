//! # netconf-core
//!
//! Protocol-engine core for netconfd.
//!
//! This crate provides:
//! - Capability identifiers, the capability registry, and negotiation
//! - Dependency-ordered, feature-filtered capability loading
//! - Subtree and XPath result filtering

pub mod capability;
pub mod error;
pub mod filter;

pub use capability::{Capability, CapabilityId, CapabilityRegistry};
pub use error::CapabilityError;
pub use filter::{Filter, XPath};

/// Keyword of the base NETCONF capability.
pub const BASE_KEYWORD: &str = "urn:ietf:params:netconf:base";

/// Keyword of the XPath filtering capability.
pub const XPATH_KEYWORD: &str = "urn:ietf:params:netconf:capability:xpath";
