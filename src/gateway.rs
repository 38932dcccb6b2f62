//! Glue between the radio engine and the MQTT bridge.
//!
//! Requests flow broker → engine, frames and errors flow engine → broker.
//! Nothing here retries or interprets traffic; failed requests are reported
//! on the log topic and the gateway moves on.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::mqtt::MqttBridge;
use crate::xbee::{XBee, XBeeEvent};

/// Bidirectional message pump between one radio and one broker
pub struct Gateway {
    xbee: Arc<XBee>,
    mqtt: MqttBridge,
}

impl Gateway {
    /// Create a gateway over an already-running engine and bridge
    pub fn new(xbee: Arc<XBee>, mqtt: MqttBridge) -> Self {
        Self { xbee, mqtt }
    }

    /// Pump messages until both channels close.
    ///
    /// Each request is served on its own task so a slow radio exchange never
    /// blocks frame forwarding or other requests.
    pub async fn run(
        &self,
        mut requests: mpsc::Receiver<String>,
        mut events: mpsc::UnboundedReceiver<XBeeEvent>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(message) => self.spawn_request(message),
                    None => break,
                },
                event = events.recv() => match event {
                    Some(XBeeEvent::Frame(frame)) => {
                        if let Err(e) = self.mqtt.publish_frame(&frame).await {
                            tracing::warn!("response publish failed: {}", e);
                        }
                    }
                    Some(XBeeEvent::Error(error)) => {
                        tracing::warn!("radio error: {}", error);
                        if let Err(e) = self.mqtt.publish_log(&error.to_string()).await {
                            tracing::warn!("log publish failed: {}", e);
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("gateway loop finished");
    }

    fn spawn_request(&self, message: String) {
        let xbee = self.xbee.clone();
        let mqtt = self.mqtt.clone();
        tokio::spawn(async move {
            match xbee.transmit_mqtt_message(&message).await {
                Ok(frame) => {
                    if let Err(e) = mqtt.publish_frame(&frame).await {
                        tracing::warn!("response publish failed: {}", e);
                    }
                }
                Err(error) => {
                    tracing::warn!("request failed: {}", error);
                    if let Err(e) = mqtt.publish_log(&error.to_string()).await {
                        tracing::warn!("log publish failed: {}", e);
                    }
                }
            }
        });
    }
}
