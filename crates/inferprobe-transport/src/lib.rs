//! Endpoint addressing and stream transports.
//!
//! This is the lowest layer of inferprobe. It resolves an [`Endpoint`]
//! (`tcp://host:port` or `unix:///path`) into either a blocking
//! [`IpcStream`], used by the one-shot configuration handshake, or an
//! [`AsyncIpcStream`], used by the long-lived streaming session.

pub mod connector;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stream;

pub use connector::Connector;
pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use listener::IpcListener;
pub use stream::{AsyncIpcStream, IpcStream};
