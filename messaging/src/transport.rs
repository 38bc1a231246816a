//! Transport and endpoint traits.
//!
//! An [`Endpoint`] is a named service hosted on a node. A [`Transport`]
//! delivers messages to endpoints addressed by [`Locator`], either as a
//! request that awaits one response or as a fire-and-forget post.

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use stratus_types::{Locator, NodeAddress};
use thiserror::Error;

/// Boxed future returned by transport and endpoint methods.
pub type MessageFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no endpoint bound at {0}")]
    NoEndpoint(Locator),
    #[error("node {address} unreachable: {message}")]
    Unreachable {
        address: NodeAddress,
        message: String,
    },
    #[error("connection to {0} closed")]
    Closed(NodeAddress),
    #[error("request to {0} timed out")]
    Timeout(Locator),
    #[error("{locator} rejected {method}: {message}")]
    Rejected {
        locator: Locator,
        method: String,
        message: String,
    },
    #[error("invalid message body: {0}")]
    Codec(String),
}

impl TransportError {
    /// Whether a later attempt at the same request could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoEndpoint(_) | Self::Unreachable { .. } | Self::Closed(_) | Self::Timeout(_)
        )
    }
}

/// A service hosted on a node.
///
/// Errors are returned as plain strings: they cross process boundaries and
/// arrive at the caller as [`TransportError::Rejected`].
pub trait Endpoint: Send + Sync {
    fn handle<'a>(&'a self, method: &'a str, body: Value) -> MessageFut<'a, Result<Value, String>>;
}

pub trait Transport: Send + Sync {
    fn request<'a>(
        &'a self,
        to: &'a Locator,
        method: &'a str,
        body: Value,
    ) -> MessageFut<'a, Result<Value, TransportError>>;

    fn post<'a>(
        &'a self,
        to: &'a Locator,
        method: &'a str,
        body: Value,
    ) -> MessageFut<'a, Result<(), TransportError>>;
}

/// Typed request: serialize `body`, await the response, decode it as `R`.
pub async fn call<B, R>(
    transport: &dyn Transport,
    to: &Locator,
    method: &str,
    body: &B,
) -> Result<R, TransportError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let body = serde_json::to_value(body).map_err(|e| TransportError::Codec(e.to_string()))?;
    let response = transport.request(to, method, body).await?;
    serde_json::from_value(response).map_err(|e| TransportError::Codec(e.to_string()))
}

/// Decode an endpoint request body, mapping failures to the endpoint error form.
pub fn decode_body<T: DeserializeOwned>(method: &str, body: Value) -> Result<T, String> {
    serde_json::from_value(body).map_err(|e| format!("bad {method} body: {e}"))
}

/// Encode an endpoint response body.
pub fn encode_body<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("encoding response: {e}"))
}
