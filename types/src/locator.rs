//! Network-addressable handles.
//!
//! A [`Locator`] names an endpoint on a node. Descriptors carry locators
//! instead of in-process references so that any process holding one can
//! reach the same service through the messaging substrate.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("node address must not be empty")]
    Empty,
    #[error("node address '{0}' must have the form host:port")]
    MissingPort(String),
    #[error("node address '{0}' has an invalid port")]
    InvalidPort(String),
}

/// A `host:port` pair.
///
/// Invariant: non-empty host and a numeric port (enforced via
/// `#[serde(try_from)]` at the deserialization boundary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn parse(raw: impl Into<String>) -> Result<Self, AddressError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        let Some((host, port)) = trimmed.rsplit_once(':') else {
            return Err(AddressError::MissingPort(trimmed.to_string()));
        };
        if host.is_empty() {
            return Err(AddressError::MissingPort(trimmed.to_string()));
        }
        if port.parse::<u16>().is_err() {
            return Err(AddressError::InvalidPort(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<NodeAddress> for String {
    fn from(value: NodeAddress) -> Self {
        value.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of one endpoint on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    address: NodeAddress,
    endpoint: String,
}

impl Locator {
    #[must_use]
    pub fn new(address: NodeAddress, endpoint: impl Into<String>) -> Self {
        Self {
            address,
            endpoint: endpoint.into(),
        }
    }

    #[must_use]
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.endpoint)
    }
}
