use anyhow::Context;
use clap::Parser;
use hopr_proxy::{ProxyConfig, ProxyController};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hopr-proxy")]
#[command(about = "Standalone intercepting proxy that marks game join requests as teleports")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, short = 'p', default_value_t = hopr_proxy::DEFAULT_PORT)]
    port: u16,

    /// Directory holding the interception CA
    #[arg(long, default_value = "~/.hopr")]
    ca_dir: PathBuf,

    /// Proxy settings file (TOML); command-line flags are ignored when given
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = if args.verbose {
        EnvFilter::from_default_env()
            .add_directive(tracing_subscriber::filter::LevelFilter::DEBUG.into())
    } else {
        EnvFilter::from_default_env()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {:?}", path))?;
            toml::from_str::<ProxyConfig>(&content)
                .with_context(|| format!("Failed to parse {:?}", path))?
        }
        None => ProxyConfig {
            host: args.host,
            port: args.port,
            ca_dir: args.ca_dir,
            ..ProxyConfig::default()
        },
    };
    config.expand_paths();

    let mut proxy = ProxyController::from_config(config);
    let addr = proxy.start().await?;

    if proxy.await_ready(Duration::from_secs(10)).await {
        info!(
            "Ready on {}; clients must trust {:?}",
            addr,
            proxy.ca_cert_path()
        );
    } else {
        proxy.stop().await?;
        anyhow::bail!("CA certificate was not ready in time");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    proxy.stop().await?;
    Ok(())
}
