//! XBee API frame types and the JSON-facing frame model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Frame type identifiers exchanged with the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    // Host-to-radio requests
    AtCommand = 0x08,
    AtCommandQueue = 0x09,
    TxRequest = 0x10,
    RemoteAtCommand = 0x17,

    // Radio-to-host responses and notifications
    AtResponse = 0x88,
    ModemStatus = 0x8A,
    TxStatus = 0x8B,
    RxPacket = 0x90,
    IoSample = 0x92,
    NodeIdentification = 0x95,
    RemoteAtResponse = 0x97,

    /// Unknown frame type
    Unknown = 0xFF,
}

impl From<u8> for FrameType {
    fn from(value: u8) -> Self {
        match value {
            0x08 => FrameType::AtCommand,
            0x09 => FrameType::AtCommandQueue,
            0x10 => FrameType::TxRequest,
            0x17 => FrameType::RemoteAtCommand,
            0x88 => FrameType::AtResponse,
            0x8A => FrameType::ModemStatus,
            0x8B => FrameType::TxStatus,
            0x90 => FrameType::RxPacket,
            0x92 => FrameType::IoSample,
            0x95 => FrameType::NodeIdentification,
            0x97 => FrameType::RemoteAtResponse,
            _ => FrameType::Unknown,
        }
    }
}

impl FrameType {
    /// Request types the codec can build into wire bytes
    pub fn is_buildable(self) -> bool {
        matches!(
            self,
            FrameType::AtCommand
                | FrameType::AtCommandQueue
                | FrameType::TxRequest
                | FrameType::RemoteAtCommand
        )
    }

    /// Response types that carry the id of the request they answer
    pub fn carries_id(self) -> bool {
        matches!(
            self,
            FrameType::AtResponse | FrameType::TxStatus | FrameType::RemoteAtResponse
        )
    }
}

/// One structured unit of the radio wire protocol.
///
/// Only `type` and `id` are interpreted by the gateway; everything else is
/// carried as an opaque field map so the MQTT surface round-trips whatever
/// the codec produces or the requester supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiFrame {
    /// Numeric frame type
    #[serde(rename = "type")]
    pub frame_type: u8,
    /// Correlation id, present for request/response frame types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u8>,
    /// Remaining frame fields, keyed by their wire-protocol names
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ApiFrame {
    /// Create an empty frame of the given type
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type: frame_type as u8,
            id: None,
            fields: Map::new(),
        }
    }

    /// Create a local AT command frame
    pub fn at_command(command: &str) -> Self {
        Self::new(FrameType::AtCommand).with_field("command", Value::from(command))
    }

    /// Set the correlation id
    pub fn with_id(mut self, id: u8) -> Self {
        self.id = Some(id);
        self
    }

    /// Set a payload field
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// The frame type as an enum, [`FrameType::Unknown`] if unrecognized
    pub fn kind(&self) -> FrameType {
        FrameType::from(self.frame_type)
    }

    /// The 64-bit source address as a hex string, if the frame has one
    pub fn remote64(&self) -> Option<&str> {
        self.fields.get("remote64").and_then(Value::as_str)
    }

    /// A payload field as a string slice
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// A payload field as an unsigned integer
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    /// A payload field holding an array of byte values
    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let array = self.fields.get(key)?.as_array()?;
        array
            .iter()
            .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect()
    }
}

/// Encode bytes as a lowercase hex string
pub fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decode a hex string into bytes
pub fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if !text.is_ascii() || text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// Render bytes as a JSON array of numbers
pub fn bytes_to_value(data: &[u8]) -> Value {
    Value::Array(data.iter().map(|&b| Value::from(b)).collect())
}
