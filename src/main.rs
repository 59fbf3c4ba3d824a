//! fileman - sandboxed file manager backend
//!
//! Serves a single root folder over HTTP for a file-manager widget: listing,
//! search, create, rename, delete, copy/move, chunked uploads, zip downloads
//! and image previews. Every path stays inside the configured root.
//!
//! Usage:
//!   fileman                      # Serve using fileman.toml or defaults
//!   fileman --config path.toml   # Start with custom config
//!   fileman --root /srv/files    # Override the served folder
//!   fileman --init               # Generate default config file

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fileman::config::Config;
use fileman::server::create_router;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "fileman")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandboxed file manager backend")]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Generate a default configuration file
    #[arg(long)]
    init: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Folder to serve (overrides config)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Listen host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    if let Some(config_path) = &args.config {
        return Ok(Config::load(config_path)?);
    }

    // Try default locations
    for path in Config::default_paths() {
        if path.exists() {
            match Config::load(&path) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    eprintln!(
                        "Warning: Failed to load config from {}: {}",
                        path.display(),
                        e
                    );
                }
            }
        }
    }
    Ok(Config::default())
}

fn init_logging(config: &Config, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = if verbose { "debug" } else { &config.logging.level };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if let Some(ref log_path) = config.logging.file {
        use tracing_subscriber::fmt::writer::MakeWriterExt;

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let file_writer = std::sync::Mutex::new(file);

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr.and(file_writer))
                    .with_ansi(false),
            )
            .init();
        eprintln!("Logging to: {}", log_path.display());
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Handle --init flag
    if args.init {
        let config_path = PathBuf::from("fileman.toml");
        let config = Config::default();
        config.save(&config_path)?;
        println!(
            "Created default configuration at: {}",
            config_path.display()
        );
        println!("\nEdit this file to set the served folder and access rules.");
        return Ok(());
    }

    let mut config = load_config(&args)?;
    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_logging(&config, args.verbose)?;
    tracing::info!("Starting fileman v{}", env!("CARGO_PKG_VERSION"));

    let manager = config.to_file_manager()?;
    tracing::info!("Serving {} as '{}'", manager.root().display(), manager.root_name());
    if config.access.is_some() {
        tracing::info!("Access rules enabled");
    }

    let app = create_router(Arc::new(manager), config.server.max_upload_size);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on http://{}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    tracing::info!("fileman shutdown complete");
    Ok(())
}
