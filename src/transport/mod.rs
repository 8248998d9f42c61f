//! Transport layer for Raft RPC communication
//!
//! - `InMemoryNetwork`: simulated network for tests (partitions, loss, delay)
//! - `HttpTransport`: HTTP/JSON transport for production

pub mod http;
pub mod inmemory;
pub mod traits;

pub use http::HttpTransport;
pub use inmemory::{InMemoryNetwork, InMemoryTransport};
pub use traits::{RpcHandler, Transport, TransportError};
