//! Join a place with the teleport flag set on the join request

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hopr_core::{ConfigLoader, ConfigPatcher, JoinOrchestrator, JoinTarget, OrchestrationState};
use hopr_proxy::CertificateAuthority;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

const LOG_ENV: &str = "HOPR_LOG";

#[derive(Parser)]
#[command(
    name = "hopr",
    about = "Join places through a local proxy that marks joins as teleports",
    version
)]
struct Args {
    /// Config file path (default: $HOPR_CONFIG or ~/.config/hopr/config.toml)
    #[arg(long, short = 'c', global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch the client into a place with the proxy in front of it
    Join {
        /// Numeric place id
        place_id: u64,
    },
    /// List client installations that would be patched
    Installs,
    /// Print the interception CA certificate path, creating the CA if needed
    Ca,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        let level = if args.verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = ConfigLoader::load_or_default(args.config).context("Failed to load configuration")?;

    match args.command {
        Command::Join { place_id } => {
            let orchestrator = Arc::new(JoinOrchestrator::from_config(&config));
            join(orchestrator, JoinTarget::new(place_id)).await
        }
        Command::Installs => {
            let installs = ConfigPatcher::new(config.install).discover();
            if installs.is_empty() {
                println!("No client installations found");
            }
            for install in installs {
                println!("{}\t{}", install.name, install.path.display());
                for version in install.versions {
                    println!("\t{}", version.display());
                }
            }
            Ok(())
        }
        Command::Ca => {
            let ca_dir = config.proxy.ca_dir.clone();
            tokio::task::spawn_blocking(move || CertificateAuthority::load_or_create(&ca_dir))
                .await
                .context("CA task panicked")?
                .context("Failed to prepare interception CA")?;
            println!("{}", config.proxy.ca_cert_path().display());
            Ok(())
        }
    }
}

async fn join(orchestrator: Arc<JoinOrchestrator>, target: JoinTarget) -> Result<()> {
    let cancel = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; restoring client settings");
                orchestrator.stop();
            }
        }
    });

    info!("Joining {}", target);
    let outcome = orchestrator.run(&target).await;
    cancel.abort();

    println!("{}", outcome.message());
    if outcome.state == OrchestrationState::Stopped && outcome.started {
        Ok(())
    } else {
        anyhow::bail!("join did not complete: {}", outcome.state)
    }
}
