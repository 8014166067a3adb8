use std::time::Duration;

use crate::session::CloseReason;

/// Errors raised by the streaming client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The transport could not be established.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A request id was submitted while an earlier request with the same id is in flight.
    #[error("request id {0} is already in flight")]
    DuplicateRequestId(u64),

    /// A response arrived for an id with no pending request.
    #[error("response for unknown request id {0}")]
    UnmatchedResponse(u64),

    /// The session ended before the request was answered.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The session is closed and accepts no new requests.
    #[error("session closed")]
    SessionClosed,

    /// The processor offered no image format this client can produce.
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// The configuration exchange returned something unusable.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The processor answered the request with an error.
    #[error("request {request_id} rejected: {message}")]
    Rejected { request_id: u64, message: String },

    /// The session closed for a reason other than a local `close()`.
    #[error("session fault: {0}")]
    SessionFault(CloseReason),

    /// `run` was called on a scheduler that already ran.
    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("invalid frame rate {0} (must be a positive, finite number of frames per second)")]
    InvalidRate(f64),

    #[error("frame error: {0}")]
    Frame(#[from] inferprobe_frame::FrameError),

    #[error("transport error: {0}")]
    Transport(#[from] inferprobe_transport::TransportError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure delivered through a pending request's result slot.
///
/// Cloneable so a single session failure can be fanned out to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("rejected: {message}")]
    Rejected { message: String },
}

impl RequestError {
    /// Convert into a [`ClientError`] attributed to `request_id`.
    pub fn into_client_error(self, request_id: u64) -> ClientError {
        match self {
            RequestError::Disconnected(reason) => ClientError::Disconnected(reason),
            RequestError::Rejected { message } => ClientError::Rejected {
                request_id,
                message,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
