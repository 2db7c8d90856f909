//! `rally`: join or create a session and play from the terminal.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rally_peer::tcp::TcpTransport;
use rally_peer::{AgentHandle, AgentView, AuthorityLink, MeshConfig, SessionAgent};
use rally_state::PeerAddress;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rally", version, about = "Rally participant")]
struct Cli {
    /// Authority address.
    #[arg(long, env = "RALLY_AUTHORITY", default_value = "127.0.0.1:4700")]
    authority: String,

    /// Local address for peer links.
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// Address other participants should dial, if not the bound one.
    #[arg(long)]
    advertise: Option<String>,

    /// TOML file with mesh settings.
    #[arg(long, env = "RALLY_PEER_CONFIG")]
    config: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Create a new session.
    Create {
        #[arg(long)]
        name: String,
        /// Keep the session out of the public listing.
        #[arg(long)]
        private: bool,
    },
    /// Join a session by code.
    Join {
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<MeshConfig> {
    match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
        }
        None => Ok(MeshConfig::default()),
    }
}

fn print_view(view: &AgentView) {
    let session = &view.session;
    println!(
        "session {} [{}] counter={} authority={}",
        session.id,
        session.status,
        session.counter,
        if view.authority_up { "up" } else { "down" }
    );
    for member in &session.members {
        let address = member
            .transport_address
            .as_ref()
            .map(PeerAddress::as_str)
            .unwrap_or("-");
        println!("  {} {} {}", member.id, member.name, address);
    }
}

async fn run_line(handle: &AgentHandle, line: &str) -> anyhow::Result<bool> {
    match line {
        "" => {}
        "inc" => println!("counter = {}", handle.increment().await?),
        "inc!" => println!("counter = {} (authority)", handle.increment_on_authority().await?),
        "start" => {
            handle.start().await?;
            println!("started");
        }
        "state" => print_view(&handle.view()),
        "refresh" => {
            handle.refresh().await?;
            print_view(&handle.view());
        }
        "peers" => {
            for peer in handle.view().open_links {
                println!("  {peer}");
            }
        }
        "leave" => {
            handle.leave().await?;
            return Ok(false);
        }
        _ => println!("commands: inc, inc!, start, state, refresh, peers, leave"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);
    let config = load_config(&cli)?;

    let advertise = cli
        .advertise
        .as_deref()
        .map(PeerAddress::new)
        .transpose()
        .context("invalid --advertise address")?;
    let transport = TcpTransport::bind(cli.listen, advertise, config.max_frame_len)
        .await
        .context("failed to bind peer listener")?;
    let link = AuthorityLink::connect(&cli.authority, config.max_frame_len)
        .await
        .with_context(|| format!("failed to reach authority at {}", cli.authority))?;

    let transport = Arc::new(transport);
    let handle = match &cli.command {
        Mode::Create { name, private } => {
            SessionAgent::create(link, transport, config, name, !private).await?
        }
        Mode::Join { code, name } => SessionAgent::join(link, transport, config, code, name).await?,
    };
    info!(member = %handle.member_id(), peer = %handle.local_address(), "ready");
    print_view(&handle.view());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    handle.leave().await?;
                    break;
                };
                match run_line(&handle, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!(error = %e, "command failed"),
                }
            }
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for ctrl-c")?;
                handle.leave().await?;
                break;
            }
        }
    }
    Ok(())
}
