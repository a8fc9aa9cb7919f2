//! iap-tunnel CLI
//!
//! Forward a local port (or this process's stdio) to a port on a remote
//! instance through a tunnel.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use iap_tunnel_proto::{ProxySettings, TargetDescriptor, DEFAULT_NETWORK_INTERFACE};
use iap_tunnel_relay::{ProxyServer, RelayConfig, RelayOutcome, ShutdownCoordinator, StdinRelay};
use iap_tunnel_session::{DirectSessionFactory, NoToken, StaticToken, TokenFile, TokenProvider};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{ConfigKey, ConfigManager, TunnelDefaults};

/// iap-tunnel - Reach remote ports through an authenticated tunnel
#[derive(Parser, Debug)]
#[command(name = "iap-tunnel")]
#[command(about = "iap-tunnel - Reach remote ports through an authenticated tunnel")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a tunnel to a port on an instance
    #[command(long_about = r#"
Start a tunnel to INSTANCE_PORT on INSTANCE. Local connections are accepted
on --local-host-port, each one relayed over its own tunnel session. With
--listen-on-stdin the process's own stdin and stdout are relayed instead,
which makes the command usable as an SSH ProxyCommand.

EXAMPLES:
  # Forward an ephemeral local port to SSH on my-vm
  iap-tunnel start my-vm 22 --project my-project --zone us-central1-a

  # Fixed local port
  iap-tunnel start my-vm 5432 --local-host-port localhost:5432

  # As an SSH ProxyCommand
  ssh -o ProxyCommand='iap-tunnel start %h 22 --listen-on-stdin' my-vm

ENVIRONMENT VARIABLES:
  IAP_TUNNEL_PROJECT       Project of the instance
  IAP_TUNNEL_ZONE          Zone of the instance
  IAP_TUNNEL_TOKEN         Access token
  IAP_TUNNEL_TOKEN_FILE    File holding the access token
  IAP_TUNNEL_URL_OVERRIDE  Tunnel endpoint to use instead of the instance
  IAP_TUNNEL_PROXY         HTTP proxy, [user:pass@]host:port
    "#)]
    Start(StartArgs),

    /// Manage defaults stored in ~/.iap-tunnel/config.json
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Name of the instance to connect to
    instance: String,

    /// Port on the instance to connect to
    instance_port: u16,

    /// Project of the instance (defaults to the configured project)
    #[arg(long, env = "IAP_TUNNEL_PROJECT")]
    project: Option<String>,

    /// Zone of the instance (defaults to the configured zone)
    #[arg(long, env = "IAP_TUNNEL_ZONE")]
    zone: Option<String>,

    /// Network interface of the instance
    #[arg(long, default_value = DEFAULT_NETWORK_INTERFACE)]
    network_interface: String,

    /// Local address to listen on: HOST:PORT, :PORT or PORT (0 picks a free port)
    #[arg(long, default_value = "localhost:0")]
    local_host_port: String,

    /// Relay stdin and stdout instead of listening on a local port
    #[arg(long, conflicts_with = "local_host_port")]
    listen_on_stdin: bool,

    /// Access token sent when opening tunnel sessions
    #[arg(long, env = "IAP_TUNNEL_TOKEN", conflicts_with = "token_file")]
    token: Option<String>,

    /// File holding the access token, re-read for every session
    #[arg(long, env = "IAP_TUNNEL_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    /// Tunnel endpoint to connect to instead of the instance itself
    #[arg(long, env = "IAP_TUNNEL_URL_OVERRIDE")]
    url_override: Option<String>,

    /// HTTP proxy for tunnel connections, [user:pass@]host:port
    #[arg(long, env = "IAP_TUNNEL_PROXY")]
    proxy: Option<String>,

    /// Maximum number of concurrent local connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Skip the connection test performed before listening
    #[arg(long)]
    no_smoke_test: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Set a default
    Set {
        #[arg(value_enum)]
        key: ConfigKey,
        value: String,
    },
    /// Show the stored defaults
    Show,
    /// Clear one default, or all of them
    Clear {
        #[arg(value_enum)]
        key: Option<ConfigKey>,
    },
}

/// Setup logging with the specified log level
///
/// Logs go to stderr; stdout carries tunnel data in stdin mode.
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false),
        )
        .with(filter)
        .init();
}

/// Split `HOST:PORT`, `:PORT` or `PORT`; the host defaults to localhost
fn parse_local_host_port(value: &str) -> Result<(String, u16)> {
    let value = value.trim();

    let (host, port) = match value.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("", value),
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = if host.is_empty() { "localhost" } else { host };

    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid local port in {:?}", value))?;

    Ok((host.to_string(), port))
}

fn build_target(args: &StartArgs, defaults: &TunnelDefaults) -> Result<TargetDescriptor> {
    let project = args
        .project
        .clone()
        .or_else(|| defaults.project.clone())
        .context("No project given; pass --project or run `iap-tunnel config set project ...`")?;
    let zone = args
        .zone
        .clone()
        .or_else(|| defaults.zone.clone())
        .context("No zone given; pass --zone or run `iap-tunnel config set zone ...`")?;

    let mut target = TargetDescriptor::new(project, zone, args.instance.clone(), args.instance_port)
        .with_network_interface(args.network_interface.clone());

    if let Some(url) = &args.url_override {
        target = target.with_url_override(url.clone());
    }
    if let Some(proxy) = &args.proxy {
        target = target.with_proxy(ProxySettings::parse(proxy).context("Invalid --proxy value")?);
    }

    target.validate().context("Invalid tunnel target")?;
    Ok(target)
}

fn build_token_provider(args: &StartArgs, defaults: &TunnelDefaults) -> Arc<dyn TokenProvider> {
    if let Some(token) = &args.token {
        return Arc::new(StaticToken::new(token.clone()));
    }

    match args.token_file.clone().or_else(|| defaults.token_file.clone()) {
        Some(path) => {
            debug!("Reading access tokens from {}", path.display());
            Arc::new(TokenFile::new(path))
        }
        None => Arc::new(NoToken),
    }
}

fn relay_config(args: &StartArgs) -> RelayConfig {
    RelayConfig::default()
        .with_max_connections(args.max_connections)
        .with_smoke_test(!args.no_smoke_test)
}

async fn run_start(args: StartArgs) -> Result<()> {
    let defaults = ConfigManager::new()?.load()?;
    let target = build_target(&args, &defaults)?;
    let tokens = build_token_provider(&args, &defaults);
    let factory = Arc::new(DirectSessionFactory::new());
    let config = relay_config(&args);

    let shutdown = ShutdownCoordinator::new();
    shutdown.install_interrupt_handler();

    if args.listen_on_stdin {
        let relay = StdinRelay::new(config, target, factory, tokens);
        let report = relay.run(&shutdown).await?;
        if let RelayOutcome::SessionUnavailable(e) = report.outcome {
            return Err(e).context("Failed to connect to the tunnel");
        }
        return Ok(());
    }

    let (host, port) = parse_local_host_port(&args.local_host_port)?;
    info!(target = %target, "Starting tunnel");

    // The server logs its own shutdown summary.
    ProxyServer::new(config, target, factory, tokens)
        .start(&host, port, shutdown)
        .await?;
    Ok(())
}

fn run_config(action: ConfigAction) -> Result<()> {
    let manager = ConfigManager::new()?;

    match action {
        ConfigAction::Set { key, value } => {
            manager.set(key, value)?;
            println!("Saved to {}", manager.path().display());
        }
        ConfigAction::Show => {
            println!("{}", manager.load()?);
        }
        ConfigAction::Clear { key } => {
            manager.clear(key)?;
            println!("Cleared");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Config { action } => run_config(action),
    }
}
