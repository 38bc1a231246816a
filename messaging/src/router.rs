//! Endpoint tables and the in-process transport.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use stratus_types::{Locator, NodeAddress};

use crate::transport::{Endpoint, MessageFut, Transport, TransportError};

/// Endpoints hosted by one node, keyed by endpoint name.
#[derive(Default)]
pub struct Router {
    endpoints: RwLock<HashMap<String, Arc<dyn Endpoint>>>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `endpoint` under `name`, replacing any previous binding.
    pub fn bind(&self, name: impl Into<String>, endpoint: Arc<dyn Endpoint>) {
        let name = name.into();
        tracing::debug!(endpoint = %name, "Binding endpoint");
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, endpoint);
    }

    pub fn unbind(&self, name: &str) -> bool {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Transport that delivers messages to routers registered in this process.
///
/// Used by a driver talking to services it hosts itself, and by tests that
/// stand up several "nodes" without opening sockets.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<NodeAddress, Arc<Router>>>,
}

impl LocalTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, address: NodeAddress, router: Arc<Router>) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, router);
    }

    pub fn remove_node(&self, address: &NodeAddress) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
    }

    fn resolve(&self, to: &Locator) -> Result<Arc<dyn Endpoint>, TransportError> {
        let router = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(to.address())
            .cloned()
            .ok_or_else(|| TransportError::Unreachable {
                address: to.address().clone(),
                message: "no such node".to_string(),
            })?;
        router
            .lookup(to.endpoint())
            .ok_or_else(|| TransportError::NoEndpoint(to.clone()))
    }
}

impl Transport for LocalTransport {
    fn request<'a>(
        &'a self,
        to: &'a Locator,
        method: &'a str,
        body: Value,
    ) -> MessageFut<'a, Result<Value, TransportError>> {
        Box::pin(async move {
            let endpoint = self.resolve(to)?;
            endpoint
                .handle(method, body)
                .await
                .map_err(|message| TransportError::Rejected {
                    locator: to.clone(),
                    method: method.to_string(),
                    message,
                })
        })
    }

    fn post<'a>(
        &'a self,
        to: &'a Locator,
        method: &'a str,
        body: Value,
    ) -> MessageFut<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let endpoint = self.resolve(to)?;
            if let Err(e) = endpoint.handle(method, body).await {
                tracing::debug!(locator = %to, method, error = %e, "Posted message rejected");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Endpoint for Echo {
        fn handle<'a>(
            &'a self,
            method: &'a str,
            body: Value,
        ) -> MessageFut<'a, Result<Value, String>> {
            Box::pin(async move {
                match method {
                    "echo" => Ok(body),
                    other => Err(format!("unknown method {other}")),
                }
            })
        }
    }

    fn addr(raw: &str) -> NodeAddress {
        NodeAddress::parse(raw).unwrap()
    }

    fn transport_with_echo() -> LocalTransport {
        let router = Arc::new(Router::new());
        router.bind("echo", Arc::new(Echo));
        let transport = LocalTransport::new();
        transport.add_node(addr("node:1"), router);
        transport
    }

    #[tokio::test]
    async fn request_reaches_bound_endpoint() {
        let transport = transport_with_echo();
        let to = Locator::new(addr("node:1"), "echo");
        let reply = transport
            .request(&to, "echo", serde_json::json!({"n": 3}))
            .await
            .unwrap();
        assert_eq!(reply["n"], 3);
    }

    #[tokio::test]
    async fn unknown_node_is_unreachable() {
        let transport = transport_with_echo();
        let to = Locator::new(addr("other:1"), "echo");
        let err = transport.request(&to, "echo", Value::Null).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn unknown_endpoint_is_reported() {
        let transport = transport_with_echo();
        let to = Locator::new(addr("node:1"), "missing");
        let err = transport.request(&to, "echo", Value::Null).await.unwrap_err();
        assert!(matches!(err, TransportError::NoEndpoint(_)));
    }

    #[tokio::test]
    async fn endpoint_errors_become_rejections() {
        let transport = transport_with_echo();
        let to = Locator::new(addr("node:1"), "echo");
        let err = transport.request(&to, "shout", Value::Null).await.unwrap_err();
        match err {
            TransportError::Rejected { method, message, .. } => {
                assert_eq!(method, "shout");
                assert!(message.contains("shout"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn post_swallows_endpoint_errors() {
        let transport = transport_with_echo();
        let to = Locator::new(addr("node:1"), "echo");
        transport.post(&to, "shout", Value::Null).await.unwrap();
    }

    #[test]
    fn unbind_removes_endpoint() {
        let router = Router::new();
        router.bind("echo", Arc::new(Echo));
        assert_eq!(router.endpoint_names(), vec!["echo".to_string()]);
        assert!(router.unbind("echo"));
        assert!(router.lookup("echo").is_none());
        assert!(!router.unbind("echo"));
    }
}
