use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::stream::AsyncIpcStream;

/// Establishes the duplex stream a streaming session runs over.
///
/// The session calls this at most once. Implementations other than
/// [`Endpoint`] are mostly useful in tests (in-memory duplex pipes).
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Stream>> + Send;
}

impl Connector for Endpoint {
    type Stream = AsyncIpcStream;

    fn connect(&self) -> impl Future<Output = Result<Self::Stream>> + Send {
        self.connect_async()
    }
}
