//! xbmq gateway binary

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use xbmq::{Gateway, MqttBridge, MqttConfig, Result, SerialTransport, XBee, XBeeOptions};

#[derive(Parser, Debug)]
#[command(name = "xbmq", version, about = "XBee to MQTT gateway")]
struct Cli {
    /// Serial device the radio is attached to.
    #[arg(long, env = "XBMQ_PORT", default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial baud rate.
    #[arg(long, env = "XBMQ_BAUD", default_value_t = 9600)]
    baud: u32,

    /// Radio API mode (1 = unescaped, 2 = escaped).
    #[arg(long, env = "XBMQ_API_MODE", default_value_t = 2)]
    api_mode: u8,

    /// MQTT broker address.
    #[arg(long, env = "XBMQ_BROKER", default_value = "mqtt://localhost:1883")]
    broker: String,

    /// Root of the gateway's MQTT topic tree.
    #[arg(long, env = "XBMQ_ROOT_TOPIC", default_value = "xbmq")]
    root_topic: String,

    /// Broker username.
    #[arg(long, env = "XBMQ_USERNAME")]
    username: Option<String>,

    /// Broker password.
    #[arg(long, env = "XBMQ_PASSWORD")]
    password: Option<String>,

    /// Minimum log level when RUST_LOG is not set.
    #[arg(long, env = "XBMQ_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Err(e) = run(cli).await {
        tracing::error!("fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    let options = XBeeOptions::new(&cli.port, cli.baud)
        .with_api_mode(cli.api_mode)
        .with_callback(move |event| {
            let _ = event_tx.send(event);
        });
    let xbee = Arc::new(XBee::create(SerialTransport::new(), options).await?);
    tracing::info!(port = %cli.port, baud = cli.baud, "radio connected");

    // Scope the topic tree by the gateway radio's address so several
    // gateways can share one broker.
    let root = match xbee.local_address().await {
        Ok(address) => format!("{}/{}", cli.root_topic, address),
        Err(e) => {
            tracing::warn!("could not read gateway address: {}", e);
            cli.root_topic.clone()
        }
    };
    tracing::info!(%root, "topic root");

    let (request_tx, request_rx) = tokio::sync::mpsc::channel(32);
    let config = MqttConfig {
        broker: cli.broker.clone(),
        root_topic: root,
        username: cli.username.clone(),
        password: cli.password.clone(),
        client_id: None,
    };
    let (mqtt, mqtt_task) = MqttBridge::begin(config, request_tx).await?;

    let gateway = Gateway::new(xbee.clone(), mqtt.clone());
    tokio::select! {
        _ = gateway.run(request_rx, event_rx) => {
            tracing::warn!("gateway stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    if let Err(e) = mqtt.end().await {
        tracing::warn!("broker shutdown: {}", e);
    }
    mqtt_task.abort();
    xbee.close();
    Ok(())
}
