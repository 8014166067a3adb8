use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::str::FromStr;
use std::time::{Duration, Instant};

use inferprobe_frame::{FrameError, FrameReader, FrameWriter, CONTROL};
use inferprobe_transport::Endpoint;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::messages::{
    Capability, ConfigurationRequest, ConfigurationResponse, ControlMessage, ImageFormat,
};

const MAX_CLIENT_FIELD_LEN: usize = 128;

/// Which configuration block of the processor's answer this client reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    V2,
    #[default]
    V3,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V2 => "v2",
            Self::V3 => "v3",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = ClientError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "v2" | "2" => Ok(Self::V2),
            "v3" | "3" => Ok(Self::V3),
            other => Err(ClientError::HandshakeFailed(format!(
                "unknown protocol version '{other}' (expected v2 or v3)"
            ))),
        }
    }
}

/// Shape of the frames the processor wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Video,
    Imagery,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Video => "video",
            Self::Imagery => "imagery",
        })
    }
}

/// Outcome of the configuration exchange. Fixed for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageFormatNegotiation {
    pub format: ImageFormat,
    pub supports_raw: bool,
    pub frame_kind: FrameKind,
}

/// Configuration for the one-shot configuration exchange.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Overall deadline for the exchange.
    pub timeout: Duration,
    /// Maximum accepted response size in bytes.
    pub max_handshake_payload: usize,
    pub client_name: String,
    pub client_version: String,
    pub protocol: ProtocolVersion,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_handshake_payload: 16 * 1024,
            client_name: "inferprobe".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: ProtocolVersion::V3,
        }
    }
}

/// Connect to `endpoint` on a dedicated blocking stream and run the exchange.
pub fn configure_endpoint(
    endpoint: &Endpoint,
    config: &HandshakeConfig,
) -> Result<ImageFormatNegotiation> {
    let stream = endpoint
        .connect_blocking(Some(config.timeout))
        .map_err(|err| ClientError::Connection(err.to_string()))?;
    let mut reader = FrameReader::new(stream.try_clone()?);
    let mut writer = FrameWriter::new(stream);
    configure(&mut reader, &mut writer, config)
}

/// Send the configuration request on CONTROL and negotiate from the answer.
pub fn configure<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &HandshakeConfig,
) -> Result<ImageFormatNegotiation> {
    validate_client_field("client_name", &config.client_name)?;
    validate_client_field("client_version", &config.client_version)?;

    let request = ControlMessage::configure(&ConfigurationRequest {
        client_name: config.client_name.clone(),
        client_version: config.client_version.clone(),
    })?;
    writer.send(CONTROL, &serde_json::to_vec(&request)?)?;
    debug!(protocol = %config.protocol, "configuration request sent");

    let deadline = Instant::now() + config.timeout;
    let payload = recv_control_payload(
        reader,
        deadline,
        config.timeout,
        config.max_handshake_payload,
    )?;
    let response: ConfigurationResponse = serde_json::from_slice(&payload)?;

    let negotiation = negotiate(&response, config.protocol)?;
    info!(
        format = %negotiation.format,
        supports_raw = negotiation.supports_raw,
        frame_kind = %negotiation.frame_kind,
        "configuration negotiated"
    );
    Ok(negotiation)
}

/// Pick the image format and frame kind from a configuration response.
pub fn negotiate(
    response: &ConfigurationResponse,
    protocol: ProtocolVersion,
) -> Result<ImageFormatNegotiation> {
    match protocol {
        ProtocolVersion::V2 => {
            let v2 = response.version.v2.as_ref().ok_or_else(|| {
                ClientError::HandshakeFailed("response has no v2 configuration".to_string())
            })?;
            Ok(ImageFormatNegotiation {
                format: v2.image_format.parse()?,
                supports_raw: false,
                frame_kind: FrameKind::Video,
            })
        }
        ProtocolVersion::V3 => {
            let v3 = response.version.processor_v3.as_ref().ok_or_else(|| {
                ClientError::HandshakeFailed(
                    "response has no processor_v3 configuration".to_string(),
                )
            })?;
            let capability = v3
                .capabilities
                .iter()
                .find(|capability| is_usable(capability))
                .ok_or_else(|| {
                    ClientError::UnsupportedFormat(
                        "no video or tiled imagery capability offered".to_string(),
                    )
                })?;
            from_capability(capability)
        }
    }
}

fn is_usable(capability: &Capability) -> bool {
    capability.video.is_some()
        || capability
            .imagery
            .as_ref()
            .is_some_and(|imagery| imagery.tiled.is_some())
}

fn from_capability(capability: &Capability) -> Result<ImageFormatNegotiation> {
    if let Some(video) = &capability.video {
        return Ok(ImageFormatNegotiation {
            format: video.image_format.parse()?,
            supports_raw: false,
            frame_kind: FrameKind::Video,
        });
    }

    match &capability.imagery {
        Some(imagery) if imagery.raw.is_some() => Ok(ImageFormatNegotiation {
            format: ImageFormat::Tiff,
            supports_raw: true,
            frame_kind: FrameKind::Imagery,
        }),
        Some(imagery) => match &imagery.tiled {
            Some(tiled) => Ok(ImageFormatNegotiation {
                format: tiled.image_format.parse()?,
                supports_raw: false,
                frame_kind: FrameKind::Imagery,
            }),
            None => Err(ClientError::UnsupportedFormat(
                "imagery capability without tiled format".to_string(),
            )),
        },
        None => Err(ClientError::UnsupportedFormat(
            "empty capability".to_string(),
        )),
    }
}

fn recv_control_payload<R: Read>(
    reader: &mut FrameReader<R>,
    deadline: Instant,
    timeout: Duration,
    max_handshake_payload: usize,
) -> Result<Vec<u8>> {
    loop {
        if Instant::now() >= deadline {
            return Err(ClientError::Timeout(timeout));
        }

        match reader.read_frame() {
            Ok(frame) if frame.channel != CONTROL => {
                return Err(ClientError::HandshakeFailed(format!(
                    "expected CONTROL channel {CONTROL}, got {}",
                    frame.channel
                )));
            }
            Ok(frame) if frame.payload.len() > max_handshake_payload => {
                return Err(ClientError::HandshakeFailed(format!(
                    "configuration response too large: {} (max {max_handshake_payload})",
                    frame.payload.len()
                )));
            }
            Ok(frame) => return Ok(frame.payload.to_vec()),
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(ClientError::Disconnected(
                    "connection closed during configuration".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn validate_client_field(name: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > MAX_CLIENT_FIELD_LEN {
        return Err(ClientError::HandshakeFailed(format!(
            "invalid {name} length: {}",
            value.len()
        )));
    }
    Ok(())
}
