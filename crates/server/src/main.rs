//! `rally-authority`: serve the Rally rendezvous authority over TCP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rally_server::discovery::{BroadcastFeed, DiscoveryNotice};
use rally_server::{Authority, AuthorityConfig, net};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rally-authority", version, about = "Rally rendezvous authority")]
struct Cli {
    /// TOML config file.
    #[arg(long, env = "RALLY_AUTHORITY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides the config file).
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Maximum display name length (overrides the config file).
    #[arg(long)]
    max_name_len: Option<usize>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_thread_ids(false))
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<AuthorityConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))?
        }
        None => AuthorityConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(max_name_len) = cli.max_name_len {
        config.max_name_len = max_name_len;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);
    let config = load_config(&cli)?;

    info!(version = env!("CARGO_PKG_VERSION"), ?config, "rally-authority starting");

    // Stand-in consumer until a listing service subscribes.
    let feed = BroadcastFeed::default();
    let mut notices = feed.subscribe();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(DiscoveryNotice::Listed {
                    id,
                    member_count,
                    creator_name,
                    ..
                }) => debug!(session = %id, member_count, %creator_name, "feed: listed"),
                Ok(DiscoveryNotice::Unlisted { id, reason }) => {
                    debug!(session = %id, %reason, "feed: unlisted")
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "discovery log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let authority = Arc::new(Authority::new(config, Arc::new(feed)));
    let listener = net::bind(&authority)
        .await
        .context("failed to bind authority listener")?;

    tokio::select! {
        () = net::serve(authority, listener) => {}
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("shutting down");
        }
    }
    Ok(())
}
