//! Dedicated sync server
//!
//! # Usage
//!
//! ```bash
//! collab-sync-server --server-ssl server.pem --client-ssl CAclient.crt
//! collab-sync-server --no-server-ssl --no-client-ssl -p 31013 -l DEBUG
//! collab-sync-server --config server.toml --log-dir /var/log/collab-sync
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use collab_sync::config::ServerConfig;
use collab_sync::logging::{self, LogLevel};
use collab_sync::server::Server;
use collab_sync::SyncError;

/// Collaborative database sync server
#[derive(Parser, Debug)]
#[command(name = "collab-sync-server")]
#[command(about = "Shares database snapshots and live edits between clients")]
#[command(disable_help_flag = true)]
struct Args {
    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Hostname to listen on
    #[arg(short = 'h', long, env = "COLLAB_SYNC_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "COLLAB_SYNC_PORT")]
    port: Option<u16>,

    /// Server certificate and private key in one PEM file
    ///
    /// Either this or --no-server-ssl is required unless --config is given.
    #[arg(
        long,
        value_name = "server.pem",
        conflicts_with = "no_server_ssl",
        required_unless_present_any = ["no_server_ssl", "config"]
    )]
    server_ssl: Option<PathBuf>,

    /// Disable server TLS (not recommended)
    #[arg(long)]
    no_server_ssl: bool,

    /// CA that client certificates must chain to
    ///
    /// Either this or --no-client-ssl is required unless --config is given.
    #[arg(
        long,
        value_name = "CAclient.crt",
        conflicts_with = "no_client_ssl",
        required_unless_present_any = ["no_client_ssl", "config"]
    )]
    client_ssl: Option<PathBuf>,

    /// Disable client certificates (not recommended)
    #[arg(long)]
    no_client_ssl: bool,

    /// Log level
    #[arg(short, long, value_enum, ignore_case = true, default_value = "info", env = "COLLAB_SYNC_LEVEL")]
    level: LogLevel,

    /// Also write logs to collab-sync.<pid>.log in this directory
    #[arg(long, env = "COLLAB_SYNC_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Idle seconds before the first keep-alive probe (0 disables)
    #[arg(long)]
    keep_alive_idle: Option<u64>,

    /// Seconds between keep-alive probes
    #[arg(long)]
    keep_alive_interval: Option<u64>,

    /// Unanswered probes before a connection is dropped
    #[arg(long)]
    keep_alive_count: Option<u32>,
}

impl Args {
    /// Merge the config file (if any) with the flags
    fn server_config(&self) -> collab_sync::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.no_server_ssl {
            config.tls.server_identity_path = None;
        } else if let Some(path) = &self.server_ssl {
            config.tls.server_identity_path = Some(path.clone());
        }
        if self.no_client_ssl {
            config.tls.client_ca_path = None;
        } else if let Some(path) = &self.client_ssl {
            config.tls.client_ca_path = Some(path.clone());
        }
        if let Some(idle) = self.keep_alive_idle {
            config.keep_alive.idle_secs = idle;
        }
        if let Some(interval) = self.keep_alive_interval {
            config.keep_alive.interval_secs = interval;
        }
        if let Some(count) = self.keep_alive_count {
            config.keep_alive.count = count;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<SyncError>()
                .map(SyncError::exit_code)
                .unwrap_or(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<()> {
    let _guard = logging::init(args.level, args.log_dir.as_deref())?;

    let config = args.server_config()?;
    if !config.tls.is_enabled() {
        tracing::warn!("Server TLS is disabled (not recommended)");
    } else if !config.tls.requires_client_cert() {
        tracing::warn!("Client certificates are disabled (not recommended)");
    }

    let server = Server::bind(config).await?;
    let addr = server.local_addr()?;
    tracing::info!("collab-sync-server ready on {}", addr);

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("server stopped unexpectedly")?;

    Ok(())
}
