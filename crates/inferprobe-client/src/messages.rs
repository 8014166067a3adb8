//! JSON message bodies carried inside frames.
//!
//! CONTROL carries [`ControlMessage`]s (configuration and completion);
//! PROCESS carries [`Request`]s outbound and [`Response`]s inbound.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClientError, RequestError, Result};

/// CONTROL message type: configuration request.
pub const CONTROL_CONFIGURE: &str = "configure";
/// CONTROL message type: the sender has finished with the stream.
pub const CONTROL_COMPLETE: &str = "complete";

/// CONTROL channel message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ControlMessage {
    pub fn configure(request: &ConfigurationRequest) -> Result<Self> {
        Ok(Self {
            msg_type: CONTROL_CONFIGURE.to_string(),
            payload: Some(serde_json::to_value(request)?),
        })
    }

    pub fn complete() -> Self {
        Self {
            msg_type: CONTROL_COMPLETE.to_string(),
            payload: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.msg_type == CONTROL_COMPLETE
    }
}

/// Client identity sent with the configuration request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigurationRequest {
    pub client_name: String,
    pub client_version: String,
}

/// Processor answer to a configuration request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigurationResponse {
    pub version: VersionEnvelope,
}

/// Per-protocol configuration blocks; a processor fills in the ones it speaks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v2: Option<V2Configuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor_v3: Option<V3Configuration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct V2Configuration {
    pub image_format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct V3Configuration {
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

/// One processing capability. Exactly one field is expected to be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imagery: Option<ImageryCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoCapability {
    pub image_format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageryCapability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiled: Option<TiledCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TiledCapability {
    pub image_format: String,
}

/// Marker: the processor accepts untiled raw imagery.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawCapability {}

/// Pixel encoding of a test image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    #[serde(rename = "RGB888")]
    RawRgb,
    #[serde(rename = "BGR888")]
    RawBgr,
    #[serde(rename = "PNG")]
    Png,
    #[serde(rename = "TIFF")]
    Tiff,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 4] = [Self::RawRgb, Self::RawBgr, Self::Png, Self::Tiff];

    /// Name used on the wire and on the command line.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::RawRgb => "RGB888",
            Self::RawBgr => "BGR888",
            Self::Png => "PNG",
            Self::Tiff => "TIFF",
        }
    }

    /// File extension used for materialized test images.
    pub fn extension(self) -> &'static str {
        match self {
            Self::RawRgb => "rgb888",
            Self::RawBgr => "bgr888",
            Self::Png => "png",
            Self::Tiff => "tiff",
        }
    }

    pub fn is_raw(self) -> bool {
        matches!(self, Self::RawRgb | Self::RawBgr)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for ImageFormat {
    type Err = ClientError;

    fn from_str(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.wire_name().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| ClientError::UnsupportedFormat(name.to_string()))
    }
}

/// Location of an image in the directory shared with the processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    pub path: PathBuf,
    pub format: ImageFormat,
}

/// Platform and sensor telemetry attached to video frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UasMetadata {
    pub platform_heading: f64,
    pub platform_pitch: f64,
    pub platform_roll: f64,
    pub sensor_latitude: f64,
    pub sensor_longitude: f64,
    pub sensor_altitude: f64,
    pub sensor_horizontal_fov: f64,
    pub sensor_vertical_fov: f64,
    pub sensor_relative_azimuth: f64,
    pub sensor_relative_elevation: f64,
    pub sensor_relative_roll: f64,
}

impl UasMetadata {
    /// Fixed telemetry sample sent with every synthetic video frame.
    pub fn sample() -> Self {
        Self {
            platform_heading: 196.22980086976426,
            platform_pitch: 2.0374156926175724,
            platform_roll: 6.805627613147374,
            sensor_latitude: 33.0033516624026,
            sensor_longitude: -110.78985552834187,
            sensor_altitude: 0.0,
            sensor_horizontal_fov: 0.409246967269398,
            sensor_vertical_fov: 0.22796978713664454,
            sensor_relative_azimuth: 113.56913759223399,
            sensor_relative_elevation: 0.0,
            sensor_relative_roll: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoFrame {
    pub image: ImageRef,
    pub width: u32,
    pub height: u32,
    pub uas: UasMetadata,
    pub timestamp_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageryFrame {
    pub image: ImageRef,
    pub width: u32,
    pub height: u32,
}

/// Body of a process request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RequestPayload {
    /// Warm-up exchange issued once before any data frame.
    Startup {},
    Video(VideoFrame),
    Imagery(ImageryFrame),
}

impl RequestPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Startup {} => "startup",
            Self::Video(_) => "video",
            Self::Imagery(_) => "imagery",
        }
    }
}

/// A correlated request on the PROCESS channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub request_id: u64,
    pub payload: RequestPayload,
}

impl Request {
    pub fn new(request_id: u64, payload: RequestPayload) -> Self {
        Self {
            request_id,
            payload,
        }
    }

    pub fn startup(request_id: u64) -> Self {
        Self::new(request_id, RequestPayload::Startup {})
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Value),
    Error(ProcessingError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingError {
    pub message: String,
}

/// A correlated response on the PROCESS channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub request_id: u64,
    pub result: Outcome,
}

impl Response {
    pub fn ok(request_id: u64, value: Value) -> Self {
        Self {
            request_id,
            result: Outcome::Ok(value),
        }
    }

    pub fn error(request_id: u64, message: impl Into<String>) -> Self {
        Self {
            request_id,
            result: Outcome::Error(ProcessingError {
                message: message.into(),
            }),
        }
    }

    /// Split into the value a waiter receives.
    pub fn into_result(self) -> std::result::Result<Value, RequestError> {
        match self.result {
            Outcome::Ok(value) => Ok(value),
            Outcome::Error(err) => Err(RequestError::Rejected {
                message: err.message,
            }),
        }
    }
}
