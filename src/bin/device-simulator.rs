//! Device simulator: connects to the hub, streams telemetry, and prints
//! every connection status transition.

use clap::{Parser, Subcommand};
use hublink::config::DeviceConfig;
use hublink::connection::DeviceClient;
use hublink::observability::init_default_logging;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// Simulated device client for hub connectivity testing
#[derive(Parser)]
#[command(name = "device-simulator")]
#[command(about = "Simulated device client for hub connectivity testing")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "device.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and stream telemetry until interrupted
    Run {
        /// Seconds between telemetry events
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
    /// Validate configuration
    Config {
        /// Show the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match DeviceConfig::load_from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { interval } => run_device(config, Duration::from_secs(interval)).await,
        Commands::Config { show } => {
            if show {
                println!("{config:#?}");
            }
            info!("configuration is valid");
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

async fn run_device(config: DeviceConfig, interval: Duration) -> hublink::DeviceResult<()> {
    let mut client = DeviceClient::from_config(&config)?;
    client.on_status_change(|status, reason| {
        info!(?status, ?reason, "status change");
    });

    info!(
        device_id = %config.device.id,
        transport = %config.transport.kind,
        "connecting to hub"
    );
    client.open().await?;

    let mut sequence = 0u64;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupt received, closing");
                break;
            }
            _ = sleep(interval) => {
                sequence += 1;
                let payload = serde_json::json!({
                    "messageId": uuid::Uuid::new_v4(),
                    "deviceId": config.device.id,
                    "sequence": sequence,
                    "sentAt": chrono::Utc::now().to_rfc3339(),
                });
                match client.send_event(serde_json::to_vec(&payload)?).await {
                    Ok(()) => info!(sequence, "telemetry sent"),
                    Err(e) => warn!(sequence, error = %e, "telemetry send failed"),
                }
            }
        }
    }

    client.close().await?;
    info!("device shutdown complete");
    Ok(())
}
