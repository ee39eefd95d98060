// sysmgr: system manager host
//
// Registers the backup/restore responder on the service bus and serves the
// bus over TCP for the backup daemon. Also offers a couple of diagnostics.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use sysmgr_bus::{RpcClient, ServiceBus};
use sysmgr_host::backup::BackupManager;
use sysmgr_host::fs::LocalFs;
use sysmgr_host::page_saver::LauncherPageSaver;
use sysmgr_host::{daemon, settings::Settings};

#[derive(Parser)]
#[command(name = "sysmgr", about = "System manager host: backup/restore responder")]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the backup service and serve the bus (foreground)
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Print the files a backup would include right now
    Files,
    /// Send one request to a running daemon and print the response
    Call {
        /// Service URI, e.g. luna://com.palm.sysMgrDataBackup/preBackup
        uri: String,

        /// JSON payload
        #[arg(default_value = "{}")]
        payload: String,

        /// Daemon port
        #[arg(short, long)]
        port: Option<u16>,

        /// Daemon address
        #[arg(short, long)]
        bind: Option<String>,
    },
}

fn build_manager(settings: &Settings) -> BackupManager {
    let pages = LauncherPageSaver::new(&settings.launcher_pages_dir);
    tracing::debug!("Launcher pages from {}", pages.pages_dir().display());
    BackupManager::new(settings, Arc::new(LocalFs), Arc::new(pages))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, bind } => {
            let bind = bind.unwrap_or_else(|| settings.daemon.bind.clone());
            let port = port.unwrap_or(settings.daemon.port);

            let bus = ServiceBus::new();
            let mut manager = build_manager(&settings);
            manager.init(&bus, &tokio::runtime::Handle::current())?;

            tracing::info!("Starting sysmgr on {}:{}", bind, port);
            daemon::run_daemon(&bind, port, bus, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Failed waiting for ctrl-c: {}", e);
                }
            })
            .await?;

            manager.shutdown();
        }
        Commands::Files => {
            let result = build_manager(&settings).pre_backup();
            if result.files.is_empty() {
                println!("No files to back up.");
            } else {
                for file in result.files {
                    println!("{}", file);
                }
            }
        }
        Commands::Call {
            uri,
            payload,
            port,
            bind,
        } => {
            let bind = bind.unwrap_or_else(|| settings.daemon.bind.clone());
            let port = port.unwrap_or(settings.daemon.port);
            let params: serde_json::Value = serde_json::from_str(&payload)
                .map_err(|e| anyhow::anyhow!("payload is not valid JSON: {}", e))?;

            let stream = tokio::net::TcpStream::connect((bind.as_str(), port)).await?;
            let (reader, writer) = tokio::io::split(stream);
            let client = RpcClient::spawn(reader, writer);
            let resp = client.call(uri, params).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
    }

    Ok(())
}
