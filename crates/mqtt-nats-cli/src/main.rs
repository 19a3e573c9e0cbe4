use anyhow::Result;
use clap::Parser;
use mqtt_nats::bridge::{BridgeConfig, BridgeServer, TlsConfig};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// MQTT 3.1.1 to NATS bridge.
#[derive(Parser)]
#[command(name = "mqtt-nats")]
#[command(version)]
#[command(about = "Bridges MQTT 3.1.1 clients onto a NATS message bus")]
struct Cli {
    /// MQTT port to listen on (defaults to 1883, or 8883 with TLS)
    #[arg(short, long)]
    port: Option<u16>,

    /// NATS server URLs separated by comma
    #[arg(long, default_value = "nats://127.0.0.1:4222")]
    nats: String,

    /// NATS subject on which retained messages can be requested
    #[arg(long)]
    retained_request_topic: Option<String>,

    /// Path to the JSON file where server state is persisted
    #[arg(long, default_value = "mqtt-nats.json")]
    storage: PathBuf,

    /// Time in milliseconds between each publish of unacknowledged messages
    #[arg(long, default_value_t = 5000)]
    repeat_rate: u64,

    /// Server certificate file; enables TLS together with --tls-key
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Private key for the server certificate
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Root certificate for verification of client TLS certificates
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let tls = match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert), Some(key)) => Some(TlsConfig {
            cert_file: cert.clone(),
            key_file: key.clone(),
            ca_file: cli.tls_ca.clone(),
        }),
        (None, None) => None,
        _ => anyhow::bail!("both --tls-cert and --tls-key must be given when TLS is enabled"),
    };
    let port = cli
        .port
        .unwrap_or(if tls.is_some() { 8883 } else { 1883 });

    let mut config = BridgeConfig::default()
        .with_port(port)
        .with_nats_urls(cli.nats)
        .with_storage_path(cli.storage)
        .with_repeat_rate(cli.repeat_rate);
    if let Some(topic) = cli.retained_request_topic {
        config = config.with_retained_request_topic(topic);
    }
    if let Some(tls) = tls {
        config = config.with_tls(tls);
    }

    let server = BridgeServer::with_config(config).await?;

    let bridge = server.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("mqtt-nats is shutting down");
        if let Err(e) = bridge.shutdown().await {
            error!("{e}");
        }
    });

    server.serve().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
