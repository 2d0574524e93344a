//! Control message wire codec.
//!
//! Every control message has the same size so that a reader can allocate a
//! single fixed buffer. The layout is little-endian:
//!
//! ```text
//! offset  size  field
//!      0     2  control_type   (0 = open streams, 1 = close streams)
//!      2     2  reserved       (zero)
//!      4     4  message_id
//!      8     2  sensor_id
//!     10     1  profile_count  (open only, <= 8)
//!     11    64  profiles[8]    { framerate:i16 format:u8 stream_type:u8 width:i16 height:i16 }
//! ```
//!
//! Unused profile slots (and all slots of a close message) are zeroed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{DevcastError, SampleFormat, StreamType};

/// Largest number of stream profiles one open-streams message can carry.
pub const MAX_OPEN_PROFILES: usize = 8;

const HEADER_SIZE: usize = 8;
const PROFILE_SIZE: usize = 8;
const BODY_SIZE: usize = 2 + 1 + MAX_OPEN_PROFILES * PROFILE_SIZE;

/// Encoded size of every control message.
pub const CONTROL_MESSAGE_SIZE: usize = HEADER_SIZE + BODY_SIZE;

const SENSOR_OPEN: u16 = 0;
const SENSOR_CLOSE: u16 = 1;

/// One requested stream configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfile {
    pub framerate: i16,
    pub format: SampleFormat,
    pub stream_type: StreamType,
    pub width: i16,
    pub height: i16,
}

/// "Open streams" payload. At most [`MAX_OPEN_PROFILES`] profiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenStreams {
    sensor_id: i16,
    profiles: Vec<StreamProfile>,
}

impl OpenStreams {
    /// # Errors
    ///
    /// [`DevcastError::ProfileLimit`] when more than [`MAX_OPEN_PROFILES`]
    /// profiles are requested; split the request across several messages.
    pub fn new(sensor_id: i16, profiles: Vec<StreamProfile>) -> Result<Self, DevcastError> {
        if profiles.len() > MAX_OPEN_PROFILES {
            return Err(DevcastError::ProfileLimit {
                requested: profiles.len(),
                max: MAX_OPEN_PROFILES,
            });
        }
        Ok(Self { sensor_id, profiles })
    }

    pub fn sensor_id(&self) -> i16 {
        self.sensor_id
    }

    pub fn profiles(&self) -> &[StreamProfile] {
        &self.profiles
    }
}

/// "Close streams" payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseStreams {
    pub sensor_id: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    OpenStreams(OpenStreams),
    CloseStreams(CloseStreams),
}

/// A control command plus the client's correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub message_id: u32,
    pub command: ControlCommand,
}

impl ControlMessage {
    pub fn new(message_id: u32, command: ControlCommand) -> Self {
        Self { message_id, command }
    }

    /// Encode into exactly [`CONTROL_MESSAGE_SIZE`] bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_MESSAGE_SIZE);
        let (control_type, sensor_id, profiles): (u16, i16, &[StreamProfile]) = match &self.command {
            ControlCommand::OpenStreams(open) => (SENSOR_OPEN, open.sensor_id, open.profiles.as_slice()),
            ControlCommand::CloseStreams(close) => (SENSOR_CLOSE, close.sensor_id, &[][..]),
        };

        buf.put_u16_le(control_type);
        buf.put_u16_le(0);
        buf.put_u32_le(self.message_id);
        buf.put_i16_le(sensor_id);
        // OpenStreams::new caps the count, so this cannot truncate.
        buf.put_u8(profiles.len() as u8);
        for profile in profiles {
            buf.put_i16_le(profile.framerate);
            buf.put_u8(profile.format as u8);
            buf.put_u8(profile.stream_type as u8);
            buf.put_i16_le(profile.width);
            buf.put_i16_le(profile.height);
        }
        buf.put_bytes(0, (MAX_OPEN_PROFILES - profiles.len()) * PROFILE_SIZE);
        buf.freeze()
    }

    /// Decode a message received on a control topic.
    ///
    /// # Errors
    ///
    /// [`DevcastError::Parse`] for a wrong size, an unknown discriminant, or
    /// an unknown profile enum value; [`DevcastError::ProfileLimit`] when the
    /// profile count exceeds [`MAX_OPEN_PROFILES`].
    pub fn decode(mut raw: &[u8]) -> Result<Self, DevcastError> {
        if raw.len() != CONTROL_MESSAGE_SIZE {
            return Err(DevcastError::Parse(format!(
                "control message is {} bytes, expected {}",
                raw.len(),
                CONTROL_MESSAGE_SIZE
            )));
        }

        let control_type = raw.get_u16_le();
        if control_type > SENSOR_CLOSE {
            return Err(DevcastError::Parse(format!(
                "unknown control type {control_type}"
            )));
        }
        let _reserved = raw.get_u16_le();
        let message_id = raw.get_u32_le();
        let sensor_id = raw.get_i16_le();
        let count = raw.get_u8() as usize;

        let command = if control_type == SENSOR_CLOSE {
            ControlCommand::CloseStreams(CloseStreams { sensor_id })
        } else {
            if count > MAX_OPEN_PROFILES {
                return Err(DevcastError::ProfileLimit {
                    requested: count,
                    max: MAX_OPEN_PROFILES,
                });
            }
            let mut profiles = Vec::with_capacity(count);
            for _ in 0..count {
                let framerate = raw.get_i16_le();
                let format = SampleFormat::try_from(raw.get_u8())?;
                let stream_type = StreamType::try_from(raw.get_u8())?;
                let width = raw.get_i16_le();
                let height = raw.get_i16_le();
                profiles.push(StreamProfile {
                    framerate,
                    format,
                    stream_type,
                    width,
                    height,
                });
            }
            ControlCommand::OpenStreams(OpenStreams { sensor_id, profiles })
        };

        Ok(Self { message_id, command })
    }
}
