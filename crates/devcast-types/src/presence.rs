//! Device-info message carried on [`DEVICE_INFO_TOPIC`](crate::DEVICE_INFO_TOPIC).

use serde::{Deserialize, Serialize};

use crate::{DeviceIdentity, DevcastError};

/// Whether the announcing device is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Connected,
    Disconnected,
}

/// JSON body of a presence broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfoMessage {
    pub name: String,
    pub serial_number: String,
    pub product_line: String,
    pub topic_root: String,
    /// Set when another client holds the device exclusively.
    pub locked: bool,
    pub state: PresenceState,
}

impl DeviceInfoMessage {
    pub fn from_identity(identity: &DeviceIdentity, state: PresenceState) -> Self {
        Self {
            name: identity.name().to_string(),
            serial_number: identity.serial().to_string(),
            product_line: identity.product_line().to_string(),
            topic_root: identity.topic_root().to_string(),
            locked: identity.locked(),
            state,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DevcastError> {
        serde_json::to_vec(self).map_err(|e| DevcastError::Serialization(e.to_string()))
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, DevcastError> {
        serde_json::from_slice(raw).map_err(|e| DevcastError::Serialization(e.to_string()))
    }
}
