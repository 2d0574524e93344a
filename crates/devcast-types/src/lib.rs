//! `devcast-types` – shared vocabulary for the device-exposure layer.
//!
//! Everything that crosses a crate boundary lives here: the device identity,
//! stream descriptors and headers, notification messages, the wire codecs
//! for control, presence, and stream-frame messages, and the workspace-wide
//! [`DevcastError`].
//!
//! # Modules
//!
//! - [`control`] – fixed-size binary codec for remote control commands.
//! - [`presence`] – JSON device-info message sent on the presence topic.
//! - [`frame`] – binary envelope for a matched sample/metadata pair.

pub mod control;
pub mod frame;
pub mod presence;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use control::{
    CloseStreams, ControlCommand, ControlMessage, OpenStreams, StreamProfile,
    CONTROL_MESSAGE_SIZE, MAX_OPEN_PROFILES,
};
pub use frame::StreamFrame;
pub use presence::{DeviceInfoMessage, PresenceState};

/// Opaque metadata property bag attached to a sample.
pub type MetadataMap = serde_json::Map<String, serde_json::Value>;

/// Prefix under which every device root is derived by default.
pub const DEFAULT_TOPIC_PREFIX: &str = "devcast";

/// Well-known topic on which every device announces its presence.
pub const DEVICE_INFO_TOPIC: &str = "devcast/device-info";

/// Topic suffix of a device's notification channel.
pub const NOTIFICATION_TOPIC: &str = "notification";

/// Topic suffix of a device's control channel.
pub const CONTROL_TOPIC: &str = "control";

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevcastError {
    /// A sample or metadata key was not strictly greater than the previous
    /// one. This is a producer bug, not a runtime condition.
    #[error("out-of-order {queue} key {key}: last enqueued key was {last}")]
    OutOfOrder { queue: String, key: u64, last: u64 },

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("invalid header for stream '{stream}': {width}x{height}")]
    InvalidHeader { stream: String, width: i16, height: i16 },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unknown stream '{0}'")]
    UnknownStream(String),

    #[error("control message parse error: {0}")]
    Parse(String),

    #[error("too many stream profiles: {requested} requested, at most {max} allowed")]
    ProfileLimit { requested: usize, max: usize },

    #[error("transport error on '{topic}': {details}")]
    Transport { topic: String, details: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Device identity
// ────────────────────────────────────────────────────────────────────────────

/// Identity of an exposed device. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    name: String,
    serial: String,
    product_line: String,
    topic_root: String,
    locked: bool,
}

impl DeviceIdentity {
    /// Build an identity whose topic root is derived under
    /// [`DEFAULT_TOPIC_PREFIX`].
    pub fn new(
        name: impl Into<String>,
        serial: impl Into<String>,
        product_line: impl Into<String>,
        locked: bool,
    ) -> Self {
        Self::with_prefix(DEFAULT_TOPIC_PREFIX, name, serial, product_line, locked)
    }

    /// Build an identity whose topic root is derived under `prefix`.
    pub fn with_prefix(
        prefix: &str,
        name: impl Into<String>,
        serial: impl Into<String>,
        product_line: impl Into<String>,
        locked: bool,
    ) -> Self {
        let name = name.into();
        let serial = serial.into();
        let topic_root = topic_root_for(prefix, &name, &serial);
        Self {
            name,
            serial,
            product_line: product_line.into(),
            topic_root,
            locked,
        }
    }

    /// Replace the derived topic root with an explicit one.
    pub fn with_topic_root(mut self, root: impl Into<String>) -> Self {
        self.topic_root = root.into().trim_end_matches('/').to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn product_line(&self) -> &str {
        &self.product_line
    }

    pub fn topic_root(&self) -> &str {
        &self.topic_root
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Full topic name of a channel living under this device's root.
    pub fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.topic_root, suffix)
    }
}

/// Derive `<prefix>/<model>/<serial>` from a device name.
///
/// The model is the last word of the name, so `"Acme Vision D435"` under
/// prefix `devcast` with serial `1234` yields `devcast/D435/1234`.
pub fn topic_root_for(prefix: &str, name: &str, serial: &str) -> String {
    let model = name.split_whitespace().last().unwrap_or("device");
    format!("{}/{}/{}", prefix.trim_end_matches('/'), model, serial)
}

// ────────────────────────────────────────────────────────────────────────────
// Streams
// ────────────────────────────────────────────────────────────────────────────

/// Kind of data a stream carries. Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StreamType {
    Depth = 1,
    Color = 2,
    Ir = 3,
    Fisheye = 4,
    Confidence = 5,
    Accel = 6,
    Gyro = 7,
    Pose = 8,
}

impl TryFrom<u8> for StreamType {
    type Error = DevcastError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => StreamType::Depth,
            2 => StreamType::Color,
            3 => StreamType::Ir,
            4 => StreamType::Fisheye,
            5 => StreamType::Confidence,
            6 => StreamType::Accel,
            7 => StreamType::Gyro,
            8 => StreamType::Pose,
            other => {
                return Err(DevcastError::Parse(format!("unknown stream type {other}")));
            }
        })
    }
}

/// Sample encoding. Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SampleFormat {
    Z16 = 1,
    Y8 = 2,
    Y16 = 3,
    Rgb8 = 4,
    Yuyv = 5,
    Motion = 6,
    Raw = 7,
}

impl TryFrom<u8> for SampleFormat {
    type Error = DevcastError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => SampleFormat::Z16,
            2 => SampleFormat::Y8,
            3 => SampleFormat::Y16,
            4 => SampleFormat::Rgb8,
            5 => SampleFormat::Yuyv,
            6 => SampleFormat::Motion,
            7 => SampleFormat::Raw,
            other => {
                return Err(DevcastError::Parse(format!("unknown sample format {other}")));
            }
        })
    }
}

/// Header describing the samples of a streaming stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub format: SampleFormat,
    pub width: i16,
    pub height: i16,
}

impl ImageHeader {
    pub fn new(format: SampleFormat, width: i16, height: i16) -> Self {
        Self { format, width, height }
    }

    /// A header is valid only when both dimensions are positive.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl From<&StreamProfile> for ImageHeader {
    fn from(profile: &StreamProfile) -> Self {
        Self::new(profile.format, profile.width, profile.height)
    }
}

/// A stream exposed by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Unique within a device; also the last topic segment.
    pub name: String,
    pub stream_type: StreamType,
    /// Sensor the stream belongs to; control messages address sensors.
    pub sensor_id: i16,
    /// `None` while the stream is not streaming.
    pub header: Option<ImageHeader>,
}

impl StreamDescriptor {
    pub fn new(name: impl Into<String>, stream_type: StreamType, sensor_id: i16) -> Self {
        Self {
            name: name.into(),
            stream_type,
            sensor_id,
            header: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.header.is_some()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Notifications
// ────────────────────────────────────────────────────────────────────────────

/// How a notification reaches remote subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Published once, as soon as the delivery task gets to it.
    OnDemand,
    /// Retained and replayed to every newly discovered subscriber.
    OnDiscovery,
}

/// A notification payload tagged with its delivery policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub policy: DeliveryPolicy,
    pub payload: Bytes,
}

impl Notification {
    pub fn on_demand(payload: impl Into<Bytes>) -> Self {
        Self {
            policy: DeliveryPolicy::OnDemand,
            payload: payload.into(),
        }
    }

    pub fn on_discovery(payload: impl Into<Bytes>) -> Self {
        Self {
            policy: DeliveryPolicy::OnDiscovery,
            payload: payload.into(),
        }
    }

    /// Serialize `value` as a JSON notification.
    pub fn json(policy: DeliveryPolicy, value: &serde_json::Value) -> Result<Self, DevcastError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| DevcastError::Serialization(e.to_string()))?;
        Ok(Self {
            policy,
            payload: Bytes::from(payload),
        })
    }
}
