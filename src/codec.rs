//! XBee API frame encoding/decoding.
//!
//! Wire format shared by both directions:
//!
//! ```text
//! +------+--------+--------+-------------------+----------+
//! | 0x7E | len_hi | len_lo | frame data[0..len] | checksum |
//! +------+--------+--------+-------------------+----------+
//! ```
//!
//! The checksum is `0xFF - (sum of frame data & 0xFF)`. In API mode 2 every
//! byte after the delimiter that collides with `0x7E`, `0x7D`, `0x11` or
//! `0x13` is sent as `0x7D, byte ^ 0x20`.

use bytes::{Buf, BytesMut};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::frames::{bytes_to_value, hex_decode, hex_encode, ApiFrame, FrameType};
use crate::Result;

/// Start-of-frame marker byte
pub const FRAME_DELIMITER: u8 = 0x7E;

const ESCAPE: u8 = 0x7D;
const XON: u8 = 0x11;
const XOFF: u8 = 0x13;
const ESCAPE_XOR: u8 = 0x20;
const NEEDS_ESCAPE: [u8; 4] = [FRAME_DELIMITER, ESCAPE, XON, XOFF];

/// Maximum frame-data length accepted from the wire
const MAX_FRAME_DATA: usize = 512;

/// Radio API operating mode, mirroring the ATAP setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMode {
    /// API operation without escapes (ATAP=1)
    Unescaped = 1,
    /// API operation with escaped control bytes (ATAP=2)
    Escaped = 2,
}

impl TryFrom<u8> for ApiMode {
    type Error = Error;

    fn try_from(value: u8) -> std::result::Result<Self, Error> {
        match value {
            1 => Ok(ApiMode::Unescaped),
            2 => Ok(ApiMode::Escaped),
            _ => Err(Error::InvalidArgument("Invalid API mode")),
        }
    }
}

/// A codec for reading and writing API frames.
///
/// Incoming bytes accumulate via [`push`](Self::push); [`decode`](Self::decode)
/// yields complete frames as they become available, discarding line noise
/// ahead of the delimiter and reporting malformed frames without losing
/// stream sync.
#[derive(Debug)]
pub struct XBeeApiCodec {
    api_mode: ApiMode,
    buffer: BytesMut,
}

impl XBeeApiCodec {
    /// Create a codec for the given API mode
    pub fn new(api_mode: ApiMode) -> Self {
        Self {
            api_mode,
            buffer: BytesMut::with_capacity(MAX_FRAME_DATA),
        }
    }

    /// Whether the codec can build frames of this type
    pub fn supports(frame_type: u8) -> bool {
        FrameType::from(frame_type).is_buildable()
    }

    /// Check that a command frame is structurally complete enough to build:
    /// a buildable type, an AT command name where one is required, and a
    /// destination address on remote frames.
    pub fn validate(frame: &ApiFrame) -> Result<()> {
        match frame.kind() {
            FrameType::AtCommand | FrameType::AtCommandQueue => {
                if frame.get_str("command").map_or(true, str::is_empty) {
                    return Err(Error::InvalidFrame);
                }
            }
            FrameType::TxRequest => {
                if !frame.fields.contains_key("destination64") {
                    return Err(Error::InvalidFrame);
                }
            }
            FrameType::RemoteAtCommand => {
                if !frame.fields.contains_key("destination64")
                    || frame.get_str("command").map_or(true, str::is_empty)
                {
                    return Err(Error::InvalidFrame);
                }
            }
            _ => return Err(Error::InvalidFrame),
        }
        Ok(())
    }

    /// Render a command frame into delimited, checksummed wire bytes
    pub fn encode(frame: &ApiFrame, api_mode: ApiMode) -> Result<Vec<u8>> {
        Self::validate(frame)?;
        let data = build_frame_data(frame)?;
        if data.len() > MAX_FRAME_DATA {
            return Err(Error::encode(format!(
                "frame data too long: {} bytes",
                data.len()
            )));
        }

        let length = (data.len() as u16).to_be_bytes();
        let check = checksum(&data);

        let mut out = Vec::with_capacity(data.len() + 4);
        out.push(FRAME_DELIMITER);
        match api_mode {
            ApiMode::Unescaped => {
                out.extend_from_slice(&length);
                out.extend_from_slice(&data);
                out.push(check);
            }
            ApiMode::Escaped => {
                push_escaped(&mut out, &length);
                push_escaped(&mut out, &data);
                push_escaped(&mut out, &[check]);
            }
        }
        Ok(out)
    }

    /// Add received bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer.
    ///
    /// Returns `None` when more bytes are needed, `Some(Err(..))` when a
    /// frame was present but malformed (the offending bytes are consumed),
    /// or `Some(Ok(frame))`.
    pub fn decode(&mut self) -> Option<Result<ApiFrame>> {
        // Discard noise ahead of the delimiter.
        while !self.buffer.is_empty() && self.buffer[0] != FRAME_DELIMITER {
            self.buffer.advance(1);
        }
        if self.buffer.is_empty() {
            return None;
        }

        let bytes = &self.buffer[..];
        let mut raw: Vec<u8> = Vec::new();
        let mut i = 1;
        while i < bytes.len() {
            let mut b = bytes[i];
            if self.api_mode == ApiMode::Escaped {
                if b == FRAME_DELIMITER {
                    // A new frame started before this one completed.
                    self.buffer.advance(i);
                    return Some(Err(Error::decode("unexpected frame delimiter")));
                }
                if b == ESCAPE {
                    if i + 1 >= bytes.len() {
                        return None;
                    }
                    i += 1;
                    b = bytes[i] ^ ESCAPE_XOR;
                }
            }
            raw.push(b);
            i += 1;

            if raw.len() == 2 {
                let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
                if len == 0 || len > MAX_FRAME_DATA {
                    self.buffer.advance(i);
                    return Some(Err(Error::decode(format!("bad frame length {}", len))));
                }
            }
            if raw.len() > 2 {
                let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
                if raw.len() == len + 3 {
                    self.buffer.advance(i);
                    let data = &raw[2..2 + len];
                    let received = raw[len + 2];
                    let expected = checksum(data);
                    if received != expected {
                        return Some(Err(Error::decode(format!(
                            "checksum mismatch: expected 0x{:02X}, got 0x{:02X}",
                            expected, received
                        ))));
                    }
                    return Some(parse_frame_data(data));
                }
            }
        }
        None
    }

    /// Number of buffered bytes awaiting a complete frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

fn checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| u32::from(b)).sum();
    0xFF - (sum & 0xFF) as u8
}

fn push_escaped(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        if NEEDS_ESCAPE.contains(&b) {
            out.push(ESCAPE);
            out.push(b ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
    }
}

fn build_frame_data(frame: &ApiFrame) -> Result<Vec<u8>> {
    let id = frame
        .id
        .ok_or_else(|| Error::encode("frame id not assigned"))?;
    let mut data = vec![frame.frame_type, id];

    match frame.kind() {
        FrameType::AtCommand | FrameType::AtCommandQueue => {
            data.extend_from_slice(&command_bytes(frame)?);
            data.extend_from_slice(&parameter_bytes(frame.fields.get("commandParameter"))?);
        }
        FrameType::TxRequest => {
            data.extend_from_slice(&address_bytes(frame.fields.get("destination64"), 8, None)?);
            data.extend_from_slice(&address_bytes(
                frame.fields.get("destination16"),
                2,
                Some(&[0xFF, 0xFE]),
            )?);
            data.push(u8_field(frame, "broadcastRadius", 0)?);
            data.push(u8_field(frame, "options", 0)?);
            data.extend_from_slice(&parameter_bytes(frame.fields.get("data"))?);
        }
        FrameType::RemoteAtCommand => {
            data.extend_from_slice(&address_bytes(frame.fields.get("destination64"), 8, None)?);
            data.extend_from_slice(&address_bytes(
                frame.fields.get("destination16"),
                2,
                Some(&[0xFF, 0xFE]),
            )?);
            data.push(u8_field(frame, "remoteCommandOptions", 0x02)?);
            data.extend_from_slice(&command_bytes(frame)?);
            data.extend_from_slice(&parameter_bytes(frame.fields.get("commandParameter"))?);
        }
        _ => return Err(Error::unsupported(format!("0x{:02X}", frame.frame_type))),
    }
    Ok(data)
}

fn command_bytes(frame: &ApiFrame) -> Result<[u8; 2]> {
    let command = frame.get_str("command").ok_or(Error::InvalidFrame)?;
    let bytes = command.as_bytes();
    if bytes.len() != 2 {
        return Err(Error::encode(format!(
            "AT command must be two characters, got {:?}",
            command
        )));
    }
    Ok([bytes[0], bytes[1]])
}

/// Payload bytes may arrive as a JSON array of numbers, a string (sent as
/// UTF-8), a single number, or be absent entirely.
fn parameter_bytes(value: Option<&Value>) -> Result<Vec<u8>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| Error::encode(format!("invalid byte value {}", v)))
            })
            .collect(),
        Some(Value::String(text)) => Ok(text.as_bytes().to_vec()),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .map(|b| vec![b])
            .ok_or_else(|| Error::encode(format!("invalid byte value {}", n))),
        Some(other) => Err(Error::encode(format!("invalid parameter value {}", other))),
    }
}

/// Addresses may arrive as hex strings or arrays of bytes
fn address_bytes(value: Option<&Value>, width: usize, default: Option<&[u8]>) -> Result<Vec<u8>> {
    let value = match value {
        Some(v) => v,
        None => return default.map(<[u8]>::to_vec).ok_or(Error::InvalidFrame),
    };
    let bytes = match value {
        Value::String(text) => {
            hex_decode(text).ok_or_else(|| Error::encode(format!("invalid address {:?}", text)))?
        }
        Value::Array(_) => parameter_bytes(Some(value))?,
        other => return Err(Error::encode(format!("invalid address value {}", other))),
    };
    if bytes.len() != width {
        return Err(Error::encode(format!(
            "address must be {} bytes, got {}",
            width,
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn u8_field(frame: &ApiFrame, key: &str, default: u8) -> Result<u8> {
    match frame.fields.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| Error::encode(format!("invalid {} value", key))),
    }
}

fn parse_frame_data(data: &[u8]) -> Result<ApiFrame> {
    let frame_type = data[0];
    let mut frame = ApiFrame {
        frame_type,
        id: None,
        fields: Map::new(),
    };

    match FrameType::from(frame_type) {
        FrameType::AtResponse => {
            ensure_len(data, 5, frame_type)?;
            frame.id = Some(data[1]);
            frame
                .fields
                .insert("command".into(), command_value(&data[2..4]));
            frame
                .fields
                .insert("commandStatus".into(), Value::from(data[4]));
            frame
                .fields
                .insert("commandData".into(), bytes_to_value(&data[5..]));
        }
        FrameType::ModemStatus => {
            ensure_len(data, 2, frame_type)?;
            frame
                .fields
                .insert("modemStatus".into(), Value::from(data[1]));
        }
        FrameType::TxStatus => {
            ensure_len(data, 7, frame_type)?;
            frame.id = Some(data[1]);
            frame
                .fields
                .insert("remote16".into(), Value::from(hex_encode(&data[2..4])));
            frame
                .fields
                .insert("transmitRetryCount".into(), Value::from(data[4]));
            frame
                .fields
                .insert("deliveryStatus".into(), Value::from(data[5]));
            frame
                .fields
                .insert("discoveryStatus".into(), Value::from(data[6]));
        }
        FrameType::RxPacket | FrameType::IoSample | FrameType::NodeIdentification => {
            ensure_len(data, 12, frame_type)?;
            frame
                .fields
                .insert("remote64".into(), Value::from(hex_encode(&data[1..9])));
            frame
                .fields
                .insert("remote16".into(), Value::from(hex_encode(&data[9..11])));
            frame
                .fields
                .insert("receiveOptions".into(), Value::from(data[11]));
            frame
                .fields
                .insert("data".into(), bytes_to_value(&data[12..]));
        }
        FrameType::RemoteAtResponse => {
            ensure_len(data, 15, frame_type)?;
            frame.id = Some(data[1]);
            frame
                .fields
                .insert("remote64".into(), Value::from(hex_encode(&data[2..10])));
            frame
                .fields
                .insert("remote16".into(), Value::from(hex_encode(&data[10..12])));
            frame
                .fields
                .insert("command".into(), command_value(&data[12..14]));
            frame
                .fields
                .insert("commandStatus".into(), Value::from(data[14]));
            frame
                .fields
                .insert("commandData".into(), bytes_to_value(&data[15..]));
        }
        _ => {
            // Unrecognized traffic passes through raw.
            frame
                .fields
                .insert("data".into(), bytes_to_value(&data[1..]));
        }
    }
    Ok(frame)
}

fn ensure_len(data: &[u8], min: usize, frame_type: u8) -> Result<()> {
    if data.len() < min {
        return Err(Error::decode(format!(
            "truncated 0x{:02X} frame: {} bytes",
            frame_type,
            data.len()
        )));
    }
    Ok(())
}

fn command_value(bytes: &[u8]) -> Value {
    Value::from(String::from_utf8_lossy(bytes).to_string())
}
