//! Messaging substrate for Stratus nodes.
//!
//! Services are [`Endpoint`]s bound by name in a [`Router`]. Callers reach
//! them through a [`Transport`]: [`LocalTransport`] for routers in the same
//! process, [`TcpTransport`] for nodes served by a [`NodeServer`].

pub mod codec;
pub mod transport;

pub(crate) mod protocol;

mod node;
mod router;

pub use node::{DEFAULT_REQUEST_TIMEOUT, NodeServer, TcpTransport};
pub use router::{LocalTransport, Router};
pub use transport::{
    Endpoint, MessageFut, Transport, TransportError, call, decode_body, encode_body,
};
