//! Binary envelope for one published sample.
//!
//! ```text
//! key:u64  format:u8  width:i16  height:i16  metadata_len:u32  metadata  payload
//! ```
//!
//! All integers are little-endian. `metadata` is a JSON object, or empty when
//! the sample was published without metadata.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{DevcastError, ImageHeader, MetadataMap, SampleFormat};

const FIXED_SIZE: usize = 8 + 1 + 2 + 2 + 4;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub key: u64,
    pub header: ImageHeader,
    pub metadata: Option<MetadataMap>,
    pub payload: Bytes,
}

impl StreamFrame {
    pub fn encode(&self) -> Result<Bytes, DevcastError> {
        let metadata = match &self.metadata {
            Some(map) => serde_json::to_vec(map)
                .map_err(|e| DevcastError::Serialization(e.to_string()))?,
            None => Vec::new(),
        };
        let mut buf = BytesMut::with_capacity(FIXED_SIZE + metadata.len() + self.payload.len());
        buf.put_u64_le(self.key);
        buf.put_u8(self.header.format as u8);
        buf.put_i16_le(self.header.width);
        buf.put_i16_le(self.header.height);
        buf.put_u32_le(metadata.len() as u32);
        buf.put_slice(&metadata);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(mut raw: Bytes) -> Result<Self, DevcastError> {
        if raw.len() < FIXED_SIZE {
            return Err(DevcastError::Serialization(format!(
                "frame is {} bytes, shorter than its {FIXED_SIZE}-byte header",
                raw.len()
            )));
        }
        let key = raw.get_u64_le();
        let format = SampleFormat::try_from(raw.get_u8())?;
        let width = raw.get_i16_le();
        let height = raw.get_i16_le();
        let metadata_len = raw.get_u32_le() as usize;
        if raw.len() < metadata_len {
            return Err(DevcastError::Serialization(format!(
                "frame metadata claims {metadata_len} bytes, {} left",
                raw.len()
            )));
        }
        let metadata_raw = raw.split_to(metadata_len);
        let metadata = if metadata_raw.is_empty() {
            None
        } else {
            Some(
                serde_json::from_slice(&metadata_raw)
                    .map_err(|e| DevcastError::Serialization(e.to_string()))?,
            )
        };
        Ok(Self {
            key,
            header: ImageHeader::new(format, width, height),
            metadata,
            payload: raw,
        })
    }
}
