//! Serial transport abstraction
//!
//! The engine owns its transport for its whole lifetime; this trait only
//! covers validated opening. Everything after the open is plain async byte
//! I/O on the returned stream.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;

use crate::Result;

/// Baud rates the gateway accepts for the radio link
pub const SUPPORTED_BAUD_RATES: &[u32] = &[
    1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400,
];

/// A factory for opened duplex byte channels to the radio
#[async_trait]
pub trait Transport: Send {
    /// The duplex stream produced by a successful open
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open the named device at the given rate.
    ///
    /// Fails with the device-level error (not present, busy, permission
    /// denied) and must leave nothing half-open behind.
    async fn open(&mut self, port: &str, baud: u32) -> Result<Self::Stream>;
}

/// Transport over a local serial device
#[derive(Debug, Default)]
pub struct SerialTransport;

impl SerialTransport {
    /// Create a new serial transport
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for SerialTransport {
    type Stream = tokio_serial::SerialStream;

    async fn open(&mut self, port: &str, baud: u32) -> Result<Self::Stream> {
        let stream = tokio_serial::new(port, baud).open_native_async()?;
        tracing::debug!(port, baud, "serial port open");
        Ok(stream)
    }
}
