//! # fanout-node
//!
//! Fan-out host binary: loads settings, opens the shared presence store,
//! starts the HTTP/WebSocket server, and renews presence leases until
//! Ctrl-C. `fanout-node client` runs an interactive line client instead.

#![deny(unsafe_code)]

mod client;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fanout_core::logging::{LogFormat, init_subscriber};
use fanout_presence::{
    ChannelDirectory, ConnectionConfig, MemorySetStore, PresenceDirectory, SetStore,
    SqliteSetStore,
};
use fanout_server::{
    FanoutServer, HttpRelayTransport, ServerConfig, bind, resolve_host_id, spawn_lease_renewal,
};
use fanout_settings::loader::parse_backend;
use fanout_settings::{
    FanoutSettings, PresenceBackend, PresenceSettings, ServerSettings, load_settings_from_path,
    settings_path,
};
use tracing::info;

/// Fan-out host.
#[derive(Parser, Debug)]
#[command(name = "fanout-node", about = "Distributed presence and message fan-out host")]
struct Cli {
    #[command(flatten)]
    serve: ServeArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a host as an account and exchange messages from stdin.
    Client(client::ClientArgs),
}

/// Overrides applied on top of the loaded settings.
#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Settings file (defaults to `~/.fanout/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Address sibling hosts use to reach this one (`host:port`).
    #[arg(long)]
    advertise: Option<String>,

    /// Maximum concurrent client connections.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Presence store backend (`memory` or `sqlite`).
    #[arg(long, value_parser = backend_arg)]
    presence_backend: Option<PresenceBackend>,

    /// Path to the shared `SQLite` presence database. Implies `--presence-backend sqlite`.
    #[arg(long)]
    presence_db: Option<PathBuf>,
}

impl ServeArgs {
    fn apply(&self, settings: &mut FanoutSettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref advertise) = self.advertise {
            settings.server.advertise = Some(advertise.clone());
        }
        if let Some(max) = self.max_connections {
            settings.server.max_connections = max;
        }
        if let Some(ref path) = self.presence_db {
            settings.presence.backend = PresenceBackend::Sqlite;
            settings.presence.sqlite_path = path.to_string_lossy().into_owned();
        }
        if let Some(backend) = self.presence_backend {
            settings.presence.backend = backend;
        }
    }
}

fn backend_arg(raw: &str) -> std::result::Result<PresenceBackend, String> {
    parse_backend(raw).ok_or_else(|| format!("unknown presence backend `{raw}` (memory, sqlite)"))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Map the settings file's server section onto the server crate's config.
fn server_config(settings: &ServerSettings) -> ServerConfig {
    ServerConfig {
        host: settings.host.clone(),
        port: settings.port,
        advertise: settings.advertise.clone(),
        max_connections: settings.max_connections,
        heartbeat_interval_secs: settings.heartbeat_interval_secs,
        heartbeat_timeout_secs: settings.heartbeat_timeout_secs,
        send_buffer: settings.send_buffer,
        ..ServerConfig::default()
    }
}

/// Open the set store backing both directories.
fn open_store(settings: &PresenceSettings) -> Result<Arc<dyn SetStore>> {
    match settings.backend {
        PresenceBackend::Memory => Ok(Arc::new(MemorySetStore::new())),
        PresenceBackend::Sqlite => {
            ensure_parent_dir(Path::new(&settings.sqlite_path))?;
            let store = SqliteSetStore::open(&settings.sqlite_path, &ConnectionConfig::default())
                .with_context(|| {
                    format!("Failed to open presence database: {}", settings.sqlite_path)
                })?;
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Client(args)) => {
            init_subscriber("warn", LogFormat::Compact);
            client::run(args).await
        }
        None => serve(cli.serve).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let path = args.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings: {}", path.display()))?;
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    init_subscriber(&settings.logging.level, settings.logging.format);
    let metrics = fanout_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let store = open_store(&settings.presence)?;
    let presence = PresenceDirectory::new(store.clone(), settings.presence.lease());
    let channels = ChannelDirectory::new(store);
    let transport = Arc::new(HttpRelayTransport::new(Duration::from_millis(
        settings.relay.timeout_ms,
    )));

    let config = server_config(&settings.server);
    let listener = bind(&config).await.context("Failed to bind server")?;
    let host = resolve_host_id(config.advertise.as_deref(), listener.local_addr()?);
    let server = FanoutServer::new(config, host.clone(), presence.clone(), channels, transport)
        .with_metrics(metrics);

    let (addr, server_handle) = server.serve(listener).await.context("Failed to serve")?;
    let mut handles = vec![server_handle];
    if settings.presence.lease().is_some() {
        handles.push(spawn_lease_renewal(
            server.registry().clone(),
            presence,
            host.clone(),
            settings.presence.renew_interval(),
            server.shutdown().token(),
        ));
    }

    info!(
        %addr,
        %host,
        backend = ?settings.presence.backend,
        "fanout node listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    server.shutdown().drain(handles, None).await;
    info!("Shutdown complete");
    Ok(())
}
