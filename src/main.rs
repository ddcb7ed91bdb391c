use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use clap::{Parser, Subcommand};
use log::{info, warn};

mod activity;
mod ble;
mod config;
mod coordinator;
mod error;
mod manager;
mod messages;
mod mqtt;
mod scanner;
mod session;

/// Bridges a Bluetooth robotic lawn mower to Home Assistant over MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the configured mower and serve it to Home Assistant (default)
    Run,
    /// Look for supported mowers nearby
    Scan {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// How long to wait when connecting to a mower to identify it
        #[arg(long, default_value_t = 30)]
        connect_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&cli.config).await,
        Command::Scan {
            seconds,
            connect_timeout,
        } => {
            scan(
                &cli.config,
                Duration::from_secs(seconds),
                Duration::from_secs(connect_timeout),
            )
            .await
        }
    }
}

async fn first_adapter() -> anyhow::Result<Adapter> {
    let bt_manager = Manager::new().await?;

    // get the first bluetooth adapter
    bt_manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .context("no bluetooth adapter found")
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = config::AppConfig::load(config_path)?;
    let mower = config
        .mower
        .context("config has no [mower] section, run `scan` to find one")?;

    let settings = mower.coordinator_settings()?;
    info!("Mower: {} ({})", mower.name(), mower.address);

    let central = first_adapter().await?;
    let coordinator = Arc::new(coordinator::Coordinator::new(
        mower.address,
        ble::GattSession::new(mower.gatt.clone()),
        ble::BleDiscovery::new(central, mower.scan_duration()),
        settings,
    ));

    let (mqtt_client, eventloop) =
        mqtt::MqttClient::new(&config.mqtt, mqtt::MowerIdentity::from_config(&mower));

    let core = manager::Manager::new(coordinator, mqtt_client, eventloop);
    core.run_loop().await?;

    Ok(())
}

async fn scan(
    config_path: &Path,
    duration: Duration,
    connect_timeout: Duration,
) -> anyhow::Result<()> {
    let configured = match config::AppConfig::load(config_path) {
        Ok(config) => config.mower.map(|mower| mower.address),
        Err(err) => {
            warn!("{:#}", err);
            None
        }
    };

    let central = first_adapter().await?;
    scanner::Scanner::new(central, duration, connect_timeout, configured)
        .run()
        .await?;

    Ok(())
}
