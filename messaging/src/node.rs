//! TCP node: a listener serving a [`Router`], and a client [`TcpTransport`].
//!
//! Every connection runs one reader task and one writer task. Requests are
//! matched to responses through a pending map keyed by envelope id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use stratus_types::{Locator, NodeAddress};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::codec::{FrameReader, FrameWriter};
use crate::protocol::{Envelope, EnvelopeKind};
use crate::router::Router;
use crate::transport::{MessageFut, Transport, TransportError};

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Default time a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

fn spawn_writer(write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut writer = FrameWriter::new(write_half);
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = writer.write_frame(&envelope).await {
                tracing::warn!("Node write error: {e:#}");
                break;
            }
        }
    })
}

/// Serves the endpoints of one [`Router`] over TCP.
///
/// Dropping the server stops accepting and closes every open connection.
pub struct NodeServer {
    address: NodeAddress,
    router: Arc<Router>,
    accept_handle: JoinHandle<()>,
}

impl NodeServer {
    /// Bind `listen` (e.g. `127.0.0.1:0`) and start accepting connections.
    pub async fn bind(listen: &str, router: Arc<Router>) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("binding node listener on {listen}"))?;
        let local = listener.local_addr().context("reading bound address")?;
        let address = NodeAddress::parse(local.to_string())
            .with_context(|| format!("bound address {local} is not a node address"))?;

        tracing::info!(address = %address, "Node listening");

        let accept_router = router.clone();
        let accept_handle = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "Accepted node connection");
                            connections.spawn(serve_connection(stream, accept_router.clone()));
                        }
                        Err(e) => {
                            tracing::warn!("Node accept error: {e}");
                        }
                    },
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                }
            }
        });

        Ok(Self {
            address,
            router,
            accept_handle,
        })
    }

    #[must_use]
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    #[must_use]
    pub fn locator(&self, endpoint: &str) -> Locator {
        Locator::new(self.address.clone(), endpoint)
    }

    pub fn shutdown(self) {
        tracing::info!(address = %self.address, "Node shutting down");
        // Drop aborts the accept task.
    }
}

impl Drop for NodeServer {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

async fn serve_connection(stream: TcpStream, router: Arc<Router>) {
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::channel::<Envelope>(WRITER_CHANNEL_CAPACITY);
    let writer_handle = spawn_writer(write_half, writer_rx);

    let mut reader = FrameReader::new(read_half);
    let mut in_flight = JoinSet::new();
    loop {
        let envelope = match reader.read_frame::<Envelope>().await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Dropping node connection: {e:#}");
                break;
            }
        };

        match envelope.kind {
            EnvelopeKind::Request | EnvelopeKind::Post => {
                let router = router.clone();
                let writer_tx = writer_tx.clone();
                in_flight.spawn(async move {
                    let reply = dispatch(&router, &envelope).await;
                    if let (EnvelopeKind::Request, Some(id)) = (envelope.kind, envelope.id) {
                        let response = match reply {
                            Ok(body) => Envelope::response(id, body),
                            Err(message) => Envelope::error(id, &message),
                        };
                        let _ = writer_tx.send(response).await;
                    }
                });
            }
            EnvelopeKind::Response | EnvelopeKind::Error => {
                tracing::trace!("Ignoring unsolicited {:?} frame", envelope.kind);
            }
        }
    }

    while in_flight.join_next().await.is_some() {}
    drop(writer_tx);
    let _ = writer_handle.await;
}

async fn dispatch(router: &Router, envelope: &Envelope) -> Result<Value, String> {
    let Some(endpoint) = router.lookup(&envelope.endpoint) else {
        return Err(format!("no endpoint named '{}'", envelope.endpoint));
    };
    endpoint
        .handle(&envelope.method, envelope.body.clone())
        .await
}

struct Connection {
    writer_tx: mpsc::Sender<Envelope>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Connection {
    async fn open(address: &NodeAddress, connect_timeout: Duration) -> Result<Self, TransportError> {
        let connect = TcpStream::connect(address.as_str());
        let stream = match tokio::time::timeout(connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Unreachable {
                    address: address.clone(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(TransportError::Unreachable {
                    address: address.clone(),
                    message: format!("connect timed out after {connect_timeout:?}"),
                });
            }
        };
        let (read_half, write_half) = stream.into_split();

        let (writer_tx, writer_rx) = mpsc::channel::<Envelope>(WRITER_CHANNEL_CAPACITY);
        let writer_handle = spawn_writer(write_half, writer_rx);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader_handle = tokio::spawn(Self::read_responses(
            read_half,
            pending.clone(),
            closed.clone(),
            address.clone(),
        ));

        Ok(Self {
            writer_tx,
            pending,
            closed,
            reader_handle,
            writer_handle,
        })
    }

    async fn read_responses(
        read_half: OwnedReadHalf,
        pending: PendingMap,
        closed: Arc<AtomicBool>,
        address: NodeAddress,
    ) {
        let mut reader = FrameReader::new(read_half);
        loop {
            match reader.read_frame::<Envelope>().await {
                Ok(Some(envelope)) => {
                    let Some(id) = envelope.id else {
                        tracing::trace!("Ignoring response frame without id from {address}");
                        continue;
                    };
                    let outcome = match envelope.kind {
                        EnvelopeKind::Response => Ok(envelope.body),
                        EnvelopeKind::Error => Err(envelope
                            .body
                            .as_str()
                            .unwrap_or("unknown error")
                            .to_string()),
                        EnvelopeKind::Request | EnvelopeKind::Post => {
                            tracing::trace!("Ignoring inbound request on client connection");
                            continue;
                        }
                    };
                    if let Some(tx) = pending.lock().await.remove(&id) {
                        let _ = tx.send(outcome);
                    }
                }
                Ok(None) => {
                    tracing::debug!("Node {address} closed connection");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Node reader error for {address}: {e:#}");
                    break;
                }
            }
        }
        closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with a closed-channel error.
        pending.lock().await.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.writer_tx.is_closed()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

/// Client side of the TCP substrate. Connections are opened lazily per node
/// address and reopened after the peer closes them.
pub struct TcpTransport {
    connections: Mutex<HashMap<NodeAddress, Arc<Connection>>>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl TcpTransport {
    #[must_use]
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            request_timeout,
        }
    }

    async fn connection(&self, address: &NodeAddress) -> Result<Arc<Connection>, TransportError> {
        if let Some(existing) = self.live_connection(address).await {
            return Ok(existing);
        }

        // Connect outside the map lock.
        let opened = Arc::new(Connection::open(address, self.request_timeout).await?);

        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(address)
            && !existing.is_closed()
        {
            return Ok(existing.clone());
        }
        connections.insert(address.clone(), opened.clone());
        Ok(opened)
    }

    async fn live_connection(&self, address: &NodeAddress) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .await
            .get(address)
            .filter(|existing| !existing.is_closed())
            .cloned()
    }
}

impl Transport for TcpTransport {
    fn request<'a>(
        &'a self,
        to: &'a Locator,
        method: &'a str,
        body: Value,
    ) -> MessageFut<'a, Result<Value, TransportError>> {
        Box::pin(async move {
            let connection = self.connection(to.address()).await?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);

            let (tx, rx) = oneshot::channel();
            connection.pending.lock().await.insert(id, tx);

            let envelope = Envelope::request(id, to.endpoint(), method, body);
            if connection.writer_tx.send(envelope).await.is_err() {
                connection.pending.lock().await.remove(&id);
                return Err(TransportError::Closed(to.address().clone()));
            }

            match tokio::time::timeout(self.request_timeout, rx).await {
                Ok(Ok(Ok(body))) => Ok(body),
                Ok(Ok(Err(message))) => Err(TransportError::Rejected {
                    locator: to.clone(),
                    method: method.to_string(),
                    message,
                }),
                Ok(Err(_)) => Err(TransportError::Closed(to.address().clone())),
                Err(_) => {
                    // Remove the entry so repeated timeouts don't grow the map.
                    connection.pending.lock().await.remove(&id);
                    Err(TransportError::Timeout(to.clone()))
                }
            }
        })
    }

    fn post<'a>(
        &'a self,
        to: &'a Locator,
        method: &'a str,
        body: Value,
    ) -> MessageFut<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let connection = self.connection(to.address()).await?;
            connection
                .writer_tx
                .send(Envelope::post(to.endpoint(), method, body))
                .await
                .map_err(|_| TransportError::Closed(to.address().clone()))
        })
    }
}
