//! mqttlink-sub - subscribe to topic filters and print what arrives
//!
//! Settings come either from flags or from a TOML config file (`--config`);
//! brokers and credentials given as flags are added on top of the file.

use clap::Parser;
use mqttlink::observability::{init_default_logging, init_from_config};
use mqttlink::packet::qos_from_u8;
use mqttlink::{
    handler, Client, ClientConfig, ClientError, ClientOptions, ConnectionState, Message, QoS,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn, Instrument};

/// Print publications received on one or more topic filters
#[derive(Parser)]
#[command(name = "mqttlink-sub")]
#[command(about = "Subscribe to MQTT topic filters and print messages")]
#[command(version)]
struct Args {
    /// Broker URL, repeatable; tried in order
    #[arg(short, long = "broker", env = "MQTT_BROKER")]
    brokers: Vec<String>,

    /// Topic filter, repeatable
    #[arg(short, long = "topic", default_value = "#")]
    topics: Vec<String>,

    /// Requested QoS (0, 1 or 2)
    #[arg(short, long, default_value_t = 0)]
    qos: u8,

    /// Client identifier, generated when omitted
    #[arg(long)]
    client_id: Option<String>,

    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Keepalive interval in seconds, 0 disables
    #[arg(long, default_value_t = 30)]
    keep_alive: u64,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum OutputFormat {
    /// Topic header line followed by the payload
    Pretty,
    /// `topic payload` on one line
    Compact,
    /// Payload only
    Raw,
}

const RESET: &str = "\x1b[0m";
const TOPIC_COLOR: &str = "\x1b[1;36m";

fn format_message(message: &Message, format: &OutputFormat) -> String {
    let payload = message.payload_str();
    match format {
        OutputFormat::Pretty => {
            let retained = if message.retain { " (retained)" } else { "" };
            format!(
                "{TOPIC_COLOR}{}{RESET} qos={}{retained}\n{payload}\n",
                message.topic, message.qos as u8
            )
        }
        OutputFormat::Compact => {
            format!("{} {}", message.topic, payload.replace('\n', " ").trim())
        }
        OutputFormat::Raw => payload.into_owned(),
    }
}

fn build_options(args: &Args) -> Result<ClientOptions, Box<dyn std::error::Error>> {
    let mut options = match &args.config {
        Some(path) => {
            let config = ClientConfig::load_from_file(path)?;
            if let Err(e) = init_from_config(&config.logging) {
                eprintln!("Logging already initialized: {e}");
            }
            config.into_options()?
        }
        None => {
            if let Err(e) = init_default_logging() {
                eprintln!("Logging already initialized: {e}");
            }
            ClientOptions::new().keep_alive(Duration::from_secs(args.keep_alive))
        }
    };

    for broker in &args.brokers {
        options = options.add_broker(broker);
    }
    if let Some(id) = &args.client_id {
        options = options.client_id(id);
    }
    if let Some(username) = &args.username {
        let password = args.password.clone().unwrap_or_default();
        options = options.credentials(username, password);
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let qos: QoS = qos_from_u8(args.qos).map_err(|_| ClientError::InvalidQos(args.qos))?;
    let options = build_options(&args)?.on_connection_lost(Arc::new(
        |_client: &Client, error: &ClientError| {
            warn!(error = %error, "Connection lost, reconnecting");
        },
    ));

    let client = Client::new(options)?;
    let span = mqttlink::client_span!(client_id = client.options().get_client_id());
    run(client, args, qos).instrument(span).await
}

async fn run(client: Client, args: Args, qos: QoS) -> Result<(), Box<dyn std::error::Error>> {
    let connect = client.connect();
    connect.wait().await;
    if let Some(e) = connect.error() {
        error!(error = %e, "Unable to connect");
        return Err(format!("connect failed: {e}").into());
    }
    info!(brokers = ?client.options().brokers(), "Connected");

    let format = args.format.clone();
    let print = handler(move |_client: &Client, message: &Message| {
        println!("{}", format_message(message, &format));
    });
    let filters: Vec<(&str, QoS)> = args.topics.iter().map(|t| (t.as_str(), qos)).collect();
    let subscribe = client.subscribe_multiple(&filters, Some(print));
    subscribe.wait().await;
    if let Some(e) = subscribe.error() {
        error!(error = %e, "Subscribe failed");
        client.disconnect(Duration::from_millis(250)).await;
        return Err(format!("subscribe failed: {e}").into());
    }
    info!(filters = ?args.topics, granted = ?subscribe.granted_qos(), "Subscribed");

    signal::ctrl_c().await?;
    info!("Shutting down");
    if client.connection_state() != ConnectionState::Disconnected {
        client.disconnect(Duration::from_millis(500)).await;
    }
    Ok(())
}
