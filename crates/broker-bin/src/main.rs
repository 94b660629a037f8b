//! Agora broker daemon.
//!
//! Loads configuration, starts the coordination bridge, logs the broker's
//! own event stream, and shuts down cleanly on SIGINT.

use std::path::PathBuf;

use agora_broker::{BrokerConfig, BrokerEvent, CoordinationBridge};
use clap::Parser;
use tracing::{info, warn};

/// Broker command line arguments.
#[derive(Parser, Debug)]
#[command(name = "agora-broker")]
#[command(about = "Coordination broker for multi-agent collaborative workspaces")]
struct Args {
	/// Path to the TOML configuration file
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

fn config_path(args: &Args) -> Option<PathBuf> {
	args.config
		.clone()
		.or_else(|| std::env::var_os("AGORA_CONFIG").map(PathBuf::from))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	let default_filter = if args.verbose { "debug" } else { "info" };
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| default_filter.into()),
		)
		.init();

	let config = match config_path(&args) {
		Some(path) => {
			info!(path = %path.display(), "loading configuration");
			BrokerConfig::load(&path)?
		}
		None => {
			info!("no configuration file given; using defaults");
			BrokerConfig::default()
		}
	};

	info!("starting agora-broker");
	let bridge = CoordinationBridge::start(config).await?;

	// Mirror the broker's own event stream into the daemon log.
	let mut events = bridge.events().subscribe();
	tokio::spawn(async move {
		loop {
			match events.recv().await {
				Ok(BrokerEvent::HealthChanged { overall }) => {
					info!(?overall, "health changed");
				}
				Ok(BrokerEvent::ReconnectFailed { backend }) => {
					warn!(%backend, "reconnect gave up; waiting for external reset");
				}
				Ok(BrokerEvent::BackendError { backend, message }) => {
					warn!(%backend, %message, "backend error");
				}
				Ok(_) => {}
				Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
				Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
			}
		}
	});

	tokio::signal::ctrl_c().await?;
	info!("interrupt received, shutting down");
	bridge.shutdown().await;
	Ok(())
}
