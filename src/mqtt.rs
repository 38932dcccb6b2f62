//! MQTT side of the gateway.
//!
//! Topic layout under the configured root:
//!
//! ```text
//! <root>/online               gateway presence, "1"/"0", retained last-will "0"
//! <root>/request              inbound command frames as JSON
//! <root>/<remote64>/response  frames from that radio as JSON
//! <root>/response             frames with no source address (local replies)
//! <root>/log                  error and status lines
//! ```
//!
//! The bridge holds no correlation logic; it forwards request payloads to the
//! engine and publishes whatever the engine hands back.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::frames::ApiFrame;
use crate::Result;

/// Delay before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(15);

const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Broker connection settings
#[derive(Debug, Clone, Default)]
pub struct MqttConfig {
    /// Broker address, `mqtt://host:port` or plain `host[:port]`
    pub broker: String,
    /// Topic root all gateway topics live under
    pub root_topic: String,
    /// Optional broker username
    pub username: Option<String>,
    /// Optional broker password
    pub password: Option<String>,
    /// Client id; `xbmq-<pid>` when not set
    pub client_id: Option<String>,
}

/// Publishing handle for the broker connection. Cheap to clone.
#[derive(Clone)]
pub struct MqttBridge {
    client: AsyncClient,
    root: String,
}

impl MqttBridge {
    /// Connect to the broker and start the poll task.
    ///
    /// The last will (retained `"0"` on the online topic) is registered
    /// before connecting, so an unclean disconnect always flips presence.
    /// Payloads arriving on the request topic are forwarded to `requests`.
    pub async fn begin(
        config: MqttConfig,
        requests: mpsc::Sender<String>,
    ) -> Result<(Self, JoinHandle<()>)> {
        if config.root_topic.trim().is_empty() {
            return Err(Error::InvalidArgument("Invalid root topic"));
        }
        let (host, port) = parse_broker(&config.broker)?;
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("xbmq-{:08x}", std::process::id()));

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(false);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        options.set_last_will(LastWill::new(
            online_topic(&config.root_topic),
            "0",
            QoS::AtMostOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let bridge = Self {
            client,
            root: config.root_topic.clone(),
        };

        let poll_client = bridge.client.clone();
        let root = config.root_topic.clone();
        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        tracing::info!("connected to broker");
                        if let Err(e) = poll_client
                            .publish(online_topic(&root), QoS::AtMostOnce, false, "1")
                            .await
                        {
                            tracing::warn!("online publish failed: {}", e);
                        }
                        if ack.session_present {
                            tracing::debug!("existing session resumed");
                        } else if let Err(e) = poll_client
                            .subscribe(request_topic(&root), QoS::AtMostOnce)
                            .await
                        {
                            tracing::warn!("request subscribe failed: {}", e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        tracing::debug!(topic = %publish.topic, "received message");
                        match String::from_utf8(publish.payload.to_vec()) {
                            Ok(message) => {
                                if requests.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => {
                                tracing::warn!(topic = %publish.topic, "dropping non-UTF-8 message")
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("broker connection lost: {}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
            tracing::debug!("MQTT poll task finished");
        });

        Ok((bridge, task))
    }

    /// Publish a frame as JSON to its response topic
    pub async fn publish_frame(&self, frame: &ApiFrame) -> Result<()> {
        let topic = response_topic(&self.root, frame.remote64());
        let payload = serde_json::to_string(frame)?;
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }

    /// Publish an error or status line to the log topic
    pub async fn publish_log(&self, message: &str) -> Result<()> {
        self.client
            .publish(log_topic(&self.root), QoS::AtMostOnce, false, message)
            .await?;
        Ok(())
    }

    /// Publish offline presence and disconnect
    pub async fn end(&self) -> Result<()> {
        self.client
            .publish(online_topic(&self.root), QoS::AtMostOnce, false, "0")
            .await?;
        self.client.disconnect().await?;
        Ok(())
    }
}

fn parse_broker(broker: &str) -> Result<(String, u16)> {
    let trimmed = broker.trim();
    let without_scheme = trimmed
        .strip_prefix("mqtt://")
        .or_else(|| trimmed.strip_prefix("tcp://"))
        .unwrap_or(trimmed);
    if without_scheme.is_empty() {
        return Err(Error::InvalidArgument("Invalid broker"));
    }
    match without_scheme.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::InvalidArgument("Invalid broker"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((without_scheme.to_string(), 1883)),
        Some(_) => Err(Error::InvalidArgument("Invalid broker")),
    }
}

fn online_topic(root: &str) -> String {
    format!("{}/online", root)
}

fn request_topic(root: &str) -> String {
    format!("{}/request", root)
}

fn log_topic(root: &str) -> String {
    format!("{}/log", root)
}

fn response_topic(root: &str, remote64: Option<&str>) -> String {
    match remote64 {
        Some(address) => format!("{}/{}/response", root, address),
        None => format!("{}/response", root),
    }
}
