use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, info};
use tokio::net::TcpListener;

use chatrun::api;
use chatrun::auth::Allowlist;
use chatrun::settings::{self, AppConfig};
use chatrun::project::ProjectRegistry;
use chatrun::service::ExecService;
use chatrun::store::Database;
use chatrun::transport::HttpTransport;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.common.config.clone();
    let config = settings::load(config_path.as_deref())?;
    init_logging(&cli.common)?;
    debug!("configuration loaded: {config:#?}");

    match cli.command {
        Command::Serve(cmd) => async_serve(config, cmd),
        Command::Init => handle_init(config_path),
    }
}

#[tokio::main]
async fn async_serve(config: AppConfig, cmd: ServeCommand) -> Result<()> {
    handle_serve(config, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "chatrun - chat-driven execution bridge for project automation CLIs.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Output machine readable JSON logs
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the execution service
    Serve(ServeCommand),
    /// Create the default config file
    Init,
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_logging(common: &CommonOpts) -> Result<()> {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = if common.quiet {
        "error"
    } else {
        match common.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chatrun={level},tower_http={level}")));

    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .ok();
    }

    Ok(())
}

fn handle_init(config_path: Option<PathBuf>) -> Result<()> {
    let path = match config_path {
        Some(p) => p,
        None => settings::default_config_path()?,
    };
    settings::write_default(&path)?;
    println!("wrote default config to {}", path.display());
    Ok(())
}

async fn handle_serve(config: AppConfig, cmd: ServeCommand) -> Result<()> {
    info!("starting chatrun execution service...");

    let db_path = config.database.resolve_path()?;
    info!("database path: {}", db_path.display());
    let database = Database::new(&db_path).await?;

    let allowlist = Allowlist::new(&config.auth);
    if config.auth.open {
        info!("allowlist disabled (open mode)");
    } else {
        info!("allowlist: {} users", config.auth.allowed_users.len());
    }

    let projects = ProjectRegistry::new(&config.projects);
    info!("projects: {:?}", projects.ids());

    let transport = Arc::new(HttpTransport::new(&config.gateway));
    info!("gateway: {}", config.gateway.base_url);

    let service = ExecService::new(&database, transport, allowlist, projects, &config.exec);
    // Orphan recovery must finish before the API can accept enqueues.
    service.bootstrap().await?;

    let host = cmd.host.unwrap_or(config.server.host);
    let port = cmd.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {host}:{port}"))?;

    let router = api::create_router(Arc::clone(&service));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("serving API")?;

    // Terminate in-flight runs through the standard sequence so their
    // store records reach a terminal status.
    service.shutdown().await;
    info!("shutdown complete");

    Ok(())
}
