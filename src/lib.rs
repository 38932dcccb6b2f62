//! xbmq - XBee to MQTT gateway
//!
//! This library bridges an XBee radio on a serial port to an MQTT broker.
//! Remote radio nodes are commanded by publishing API frames as JSON to the
//! gateway's request topic; everything the radio produces comes back on
//! per-node response topics.
//!
//! The core is the [`XBee`] correlation engine, which turns the radio's
//! event-driven framed serial protocol into awaitable request/response calls
//! usable from any number of tasks at once.
//!
//! # Example
//!
//! ```no_run
//! use xbmq::{ApiFrame, SerialTransport, XBee, XBeeOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), xbmq::Error> {
//!     let options = XBeeOptions::new("/dev/ttyUSB0", 9600)
//!         .with_callback(|event| println!("unsolicited: {:?}", event));
//!     let xbee = XBee::create(SerialTransport::new(), options).await?;
//!
//!     // Read the local baud-rate register.
//!     let reply = xbee.transmit(ApiFrame::at_command("BD")).await?;
//!     println!("BD = {:?}", reply.get_bytes("commandData"));
//!
//!     xbee.close();
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod frames;
pub mod gateway;
pub mod mqtt;
pub mod transport;
pub mod xbee;

pub use codec::{ApiMode, XBeeApiCodec};
pub use error::Error;
pub use frames::{ApiFrame, FrameType};
pub use gateway::Gateway;
pub use mqtt::{MqttBridge, MqttConfig};
pub use transport::{SerialTransport, Transport};
pub use xbee::{XBee, XBeeCallback, XBeeEvent, XBeeOptions, DEFAULT_TIMEOUT};

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;
