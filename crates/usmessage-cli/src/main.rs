//! usMessage CLI
//!
//! Talks to a paired phone from the terminal.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use usmessage_ble::BleTransport;
use usmessage_core::transport::{MockTransport, Transport};
use usmessage_core::{DeviceId, SyncContext};

use usmessage_cli::{Cli, CliConfig, CommandDispatcher, Result, TransportChoice};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = CliConfig::load(cli.config.as_deref())?;

    let transport: Arc<dyn Transport> = match cli.transport {
        TransportChoice::Ble => Arc::new(BleTransport::with_config(config.ble_config())),
        TransportChoice::Mock => Arc::new(MockTransport::demo()),
    };
    let sync_config = config
        .sync_config(cli.data_dir.as_deref())
        .with_default_transport(transport.kind());
    info!("Attachments cached in {}", sync_config.attachment_dir.display());

    let context = SyncContext::builder()
        .with_config(sync_config)
        .with_transport(transport)
        .build();

    let mut dispatcher = CommandDispatcher::new(context, cli.device.map(DeviceId::from));
    let outcome = dispatcher.execute(cli.command).await;
    if let Err(e) = dispatcher.finish().await {
        warn!("Disconnect on exit failed: {}", e);
    }
    outcome
}

/// Log to stderr; `RUST_LOG` wins over `--verbose`
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
