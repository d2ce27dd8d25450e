use anyhow::{Context, Result};
use clap::Parser;
use outrigger_api::ApiServer;
use outrigger_core::config::{AppConfig, LogFormat, LoggingConfig};
use outrigger_loader::{Broker, Loader};
use outrigger_plugin_api::{host::shutdown_signal, tls};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Outrigger - extension host that runs plugins as child processes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "OUTRIGGER_CONFIG", default_value = "config/outrigger.yaml")]
    config: PathBuf,

    /// Override the plugin directory
    #[arg(long, env = "OUTRIGGER_PLUGIN_DIR")]
    plugin_dir: Option<PathBuf>,

    /// Override the REST port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if args.config.exists() {
        AppConfig::from_config_builder(&args.config)
            .with_context(|| format!("Failed to load config file: {:?}", args.config))?
    } else {
        AppConfig::default()
    };

    if let Some(dir) = &args.plugin_dir {
        config.loader.directory = dir.clone();
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json {
        config.logging.format = LogFormat::Json;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(logging.filter_directives()))
        .context("Invalid log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(logging.file_line)
        .with_line_number(logging.file_line);

    match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install default crypto provider for rustls
    tls::install_default_provider();

    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging)?;

    if !args.config.exists() {
        warn!(path = ?args.config, "Config file not found, using defaults");
    }
    info!(
        agent = %config.agent.name,
        plugin_dir = ?config.loader.directory,
        secure_by_default = config.agent.secure_by_default,
        "Starting outrigger"
    );

    let loader = Loader::from_config(&config).context("Failed to build loader")?;
    if config.loader.broker_enabled {
        Broker::new(loader.clone())
            .start()
            .await
            .context("Failed to start broker")?;
    }

    let loaded = loader
        .initialize(config.agent.secure_by_default)
        .await
        .context("Failed to initialize loader")?;
    info!(count = loaded.len(), plugins = ?loaded, "Plugins loaded");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let server = ApiServer::new(config.api.clone(), loader.clone());
    let result = server.run(shutdown).await;
    if let Err(e) = &result {
        error!(error = %e, "Server error");
    }

    info!("Closing plugins");
    loader
        .close_all(Duration::from_secs(config.agent.shutdown_timeout_secs))
        .await;
    info!("Shutdown complete");

    result
}
