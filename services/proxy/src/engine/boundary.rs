//! Collaborator seams: byte streams, clusters and source re-acquisition.

use std::fmt;
use std::io;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};

/// A full-duplex byte stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// A destination that hands out streams.
#[async_trait]
pub trait Cluster: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Whether a session may reconnect after an established stream drops.
    fn retriable(&self) -> bool {
        true
    }

    /// Opens a stream for a session with the given metadata.
    async fn stream(&self, metadata: &Value) -> io::Result<BoxedStream>;

    /// JSON view for the admin surface.
    fn describe(&self) -> Value {
        json!({ "name": self.name() })
    }
}

/// Re-opens a session's source after it failed.
///
/// Listeners whose sources can be re-established (datagram peers, client
/// reconnect protocols) provide one per session.
#[async_trait]
pub trait SourceReacquire: Send + Sync {
    async fn reacquire(&self, metadata: &Value) -> io::Result<BoxedStream>;
}
