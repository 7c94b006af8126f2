//! keybridge CLI: inspect keyboards and run a capture passthrough.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use keybridge_engine::setup::{linux_session, load_config};
use keybridge_engine::EngineError;
use keybridge_types::{DeviceFilter, IdentityHash};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(
    name = "keybridge",
    about = "Capture keyboards and mirror their state into a virtual keyboard",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List present keyboards.
    List {
        /// Also show identity hash and vendor/product id.
        #[arg(long)]
        ids: bool,
    },

    /// Report whether the virtual keyboard service is available.
    Driver,

    /// Seize keyboards and forward every key to the virtual keyboard
    /// until interrupted.
    Passthrough {
        /// Capture only keyboards with this exact name.
        #[arg(short, long, conflicts_with = "id")]
        device: Option<String>,

        /// Capture only the keyboard with this identity hash.
        #[arg(long)]
        id: Option<IdentityHash>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.session.log_level)),
        )
        .init();

    let session = Arc::new(linux_session(&config));

    match cli.command {
        Commands::List { ids } => {
            for info in session.list_devices() {
                if ids {
                    println!(
                        "{}  {:04x}:{:04x}  {}",
                        info.identity, info.vendor_id, info.product_id, info.name
                    );
                } else {
                    println!("{}", info.name);
                }
            }
        }
        Commands::Driver => {
            if session.driver_activated() {
                println!("virtual keyboard service available");
            } else {
                println!("virtual keyboard service unavailable (is /dev/uinput writable?)");
            }
        }
        Commands::Passthrough { device, id } => {
            let filter = match (device, id) {
                (_, Some(hash)) => DeviceFilter::Identity(hash),
                (name, None) => DeviceFilter::from_name(name.as_deref()),
            };
            if !session.register(&filter) {
                bail!("no keyboard matches {filter}");
            }

            match session.grab() {
                Ok(()) => {}
                Err(EngineError::NothingRegistered) => bail!("nothing registered"),
                Err(e) => return Err(e).context("failed to grab keyboards"),
            }

            let interrupted = Arc::clone(&session);
            ctrlc::set_handler(move || {
                info!("interrupted, releasing keyboards");
                interrupted.release();
            })
            .context("failed to install interrupt handler")?;

            info!(%filter, "passthrough running, press Ctrl-C to stop");
            while let Some(event) = session.wait_key() {
                debug!(%event, "captured");
                if let Err(e) = session.send_key(&event) {
                    warn!(%event, error = %e, "event not applied");
                }
            }
            session.release();
        }
    }

    Ok(())
}
