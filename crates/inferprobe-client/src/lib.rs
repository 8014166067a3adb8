//! Streaming correlation client for inference processors.
//!
//! A run has three phases:
//! 1. [`handshake::configure_endpoint`] negotiates the image format over a
//!    short-lived blocking connection.
//! 2. A [`StreamSession`] opens one duplex stream and correlates responses to
//!    requests through a [`CorrelationTable`].
//! 3. A [`FrameScheduler`] sends a startup request, then a synthetic frame at
//!    a fixed rate, observing each response as it arrives.

pub mod correlation;
pub mod error;
pub mod handshake;
pub mod image;
pub mod messages;
pub mod scheduler;
pub mod session;

pub use correlation::{CorrelationTable, PendingResponse};
pub use error::{ClientError, RequestError, Result};
pub use handshake::{
    configure, configure_endpoint, negotiate, FrameKind, HandshakeConfig, ImageFormatNegotiation,
    ProtocolVersion,
};
pub use image::{ImageProvisioner, SyntheticImage, TestImage};
pub use messages::{
    ConfigurationRequest, ConfigurationResponse, ControlMessage, ImageFormat, Request,
    RequestPayload, Response,
};
pub use scheduler::{
    period_from_rate, FrameFactory, FrameScheduler, RunSummary, SchedulerConfig, SchedulerState,
};
pub use session::{CloseReason, SessionConfig, SessionState, StreamSession};
