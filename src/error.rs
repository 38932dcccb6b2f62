//! Error types for the xbmq gateway

use thiserror::Error;

/// The main error type for gateway operations
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected construction options (bad port, baud rate, API mode, or
    /// missing observer callback). Carries the user-facing message verbatim.
    #[error("{0}")]
    InvalidArgument(&'static str),

    /// Serial device errors, including open failures
    #[error("Serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O errors on the serial stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed command frame passed to transmit
    #[error("Invalid frame")]
    InvalidFrame,

    /// The caller supplied a frame id that is still awaiting a reply
    #[error("Frame id {0} is already in flight")]
    DuplicateFrameId(u8),

    /// Every frame id is currently awaiting a reply
    #[error("No frame ids available")]
    IdsExhausted,

    /// The codec cannot build the requested frame type
    #[error("XBee API does not implement building frame type {0}")]
    UnsupportedFrameType(String),

    /// A structurally valid frame could not be rendered to wire bytes
    #[error("Encode error: {0}")]
    Encode(String),

    /// An inbound request message was not valid JSON
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Incoming wire bytes could not be decoded into a frame
    #[error("Decode error: {0}")]
    Decode(String),

    /// Write attempted on a closed or never-opened serial port
    #[error("Port is not open")]
    TransportNotOpen,

    /// No matching reply arrived within the deadline
    #[error("XBee not responding")]
    Timeout,

    /// The serial port closed while requests were outstanding
    #[error("Port closed")]
    TransportClosed,

    /// The radio answered an AT command with a non-zero status
    #[error("AT command {command} failed with status {status}")]
    AtCommandFailed {
        /// Two-character AT command name
        command: String,
        /// Status byte from the response frame
        status: u8,
    },

    /// MQTT client errors
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

impl Error {
    /// Create an encode error
    pub fn encode(msg: impl Into<String>) -> Self {
        Error::Encode(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    /// Create an unsupported-frame-type error
    pub fn unsupported(frame_type: impl Into<String>) -> Self {
        Error::UnsupportedFrameType(frame_type.into())
    }
}
