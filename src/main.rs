//! SilverGuard CLI
//!
//! Runs the fall-detection fusion server and its maintenance commands.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use silverguard_fusion::{
    classifier::{ClassificationRequest, Classifier, SubprocessClassifier},
    config::{Config, DEFAULT_SENSITIVITY},
    core::{clamp_sensitivity, AccelSample, DeviceClass},
    stats::read_persisted,
    VERSION,
};

#[derive(Parser)]
#[command(name = "silverguard")]
#[command(version = VERSION)]
#[command(about = "Multi-sensor fall-detection fusion engine", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ingestion server
    Serve {
        /// Address to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Deliver alerts to this URL
        #[arg(long)]
        webhook_url: Option<String>,

        /// Bearer token for the webhook
        #[arg(long)]
        webhook_token: Option<String>,

        /// Evict sessions idle for this many seconds
        #[arg(long)]
        idle_eviction_secs: Option<u64>,
    },

    /// Run the configured classifier once against a saved window
    Classify {
        /// Device class whose classifier to run (wearable/iot or handheld/phone)
        #[arg(long)]
        device: String,

        /// JSON file with the window: an array of samples or {"data": [...]}
        #[arg(long)]
        input: PathBuf,

        /// Classifier sensitivity (1-100)
        #[arg(long)]
        sensitivity: Option<i64>,
    },

    /// Show configuration
    Config,

    /// Show persisted engine statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("silverguard_fusion=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::config_path);

    match cli.command {
        Commands::Serve {
            host,
            port,
            webhook_url,
            webhook_token,
            idle_eviction_secs,
        } => {
            let mut config = load_config(&config_path)?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if webhook_url.is_some() {
                config.notifier.webhook_url = webhook_url;
            }
            if webhook_token.is_some() {
                config.notifier.webhook_token = webhook_token;
            }
            if let Some(secs) = idle_eviction_secs {
                config.fusion.session_idle_timeout = Some(Duration::from_secs(secs));
            }
            config.validate().context("invalid configuration")?;
            cmd_serve(config).await
        }
        Commands::Classify {
            device,
            input,
            sensitivity,
        } => cmd_classify(&load_config(&config_path)?, &device, &input, sensitivity).await,
        Commands::Config => cmd_config(&config_path),
        Commands::Status => cmd_status(&load_config(&config_path)?),
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load_from(path).with_context(|| format!("failed to load configuration from {path:?}"))
}

#[cfg(feature = "server")]
async fn cmd_serve(config: Config) -> Result<()> {
    use silverguard_fusion::{
        engine::{FusionEngine, SystemClock},
        notifier, remote,
        server::{self, ServerConfig},
        stats::EngineStats,
    };

    println!("SilverGuard fusion v{VERSION}");
    println!();
    println!("  Wearable classifier: {}", config.wearable.command.join(" "));
    println!("  Handheld classifier: {}", config.handheld.command.join(" "));
    println!(
        "  Cross-check window: {}ms, cooldown: {}ms, liveness timeout: {}ms",
        config.fusion.cross_check_window.as_millis(),
        config.fusion.cooldown.as_millis(),
        config.fusion.liveness_timeout.as_millis()
    );
    match config.fusion.session_idle_timeout {
        Some(idle) => println!("  Idle eviction: after {}s", idle.as_secs()),
        None => println!("  Idle eviction: disabled"),
    }
    println!();

    let stats = Arc::new(EngineStats::with_persistence(config.stats_path()));
    let notifier = notifier::from_settings(&config.notifier).context("failed to set up notifier")?;
    let engine = FusionEngine::new(
        &config,
        Arc::new(SubprocessClassifier::from_config(&config)),
        notifier,
        Arc::new(SystemClock),
        Arc::clone(&stats),
    );

    let (remote_handle, remote_rx) = remote::channel(remote::DEFAULT_CHANNEL_CAPACITY);
    let listener = remote::spawn_listener(Arc::clone(&engine), remote_rx);
    let sweep = engine.spawn_eviction_sweep();

    let (addr, shutdown_tx) = server::run(
        ServerConfig::from(&config.server),
        Arc::clone(&engine),
        remote_handle,
    )
    .await
    .context("failed to start server")?;

    println!("Listening on http://{addr}");
    println!("Press Ctrl+C to stop");
    println!();

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("failed to set Ctrl+C handler")?;
    let _ = stop_rx.recv().await;

    println!();
    println!("Shutting down...");
    let _ = shutdown_tx.send(());
    if let Some(sweep) = sweep {
        sweep.abort();
    }
    listener.abort();

    // Alerts already confirmed must still go out.
    if tokio::time::timeout(Duration::from_secs(15), engine.flush_all_notifications())
        .await
        .is_err()
    {
        tracing::warn!("Timed out waiting for pending notifications");
    }

    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save statistics: {e}");
    }
    println!();
    println!("{}", stats.summary());
    Ok(())
}

#[cfg(not(feature = "server"))]
async fn cmd_serve(_config: Config) -> Result<()> {
    bail!("this build does not include the server feature")
}

/// Window file accepted by `classify`.
#[derive(Deserialize)]
#[serde(untagged)]
enum WindowFile {
    Samples(Vec<AccelSample>),
    Document { data: Vec<AccelSample> },
}

async fn cmd_classify(
    config: &Config,
    device: &str,
    input: &Path,
    sensitivity: Option<i64>,
) -> Result<()> {
    let Some(device) = DeviceClass::from_wire(device) else {
        bail!("unknown device class {device:?}, expected wearable/iot or handheld/phone");
    };

    let content =
        std::fs::read_to_string(input).with_context(|| format!("failed to read {input:?}"))?;
    let window = match serde_json::from_str::<WindowFile>(&content)
        .with_context(|| format!("{input:?} does not contain a sample window"))?
    {
        WindowFile::Samples(samples) | WindowFile::Document { data: samples } => samples,
    };
    if window.is_empty() {
        bail!("{input:?} contains no samples");
    }

    let request = ClassificationRequest {
        user_id: "cli".to_string(),
        device,
        window,
        sensitivity: sensitivity.map(clamp_sensitivity).unwrap_or(DEFAULT_SENSITIVITY),
    };

    let summary = request.summary();
    println!(
        "Classifying {} {} samples (peak {:.2}g, mean {:.2}g) at sensitivity {}",
        summary.samples, device, summary.peak_magnitude, summary.mean_magnitude, request.sensitivity
    );

    let verdict = SubprocessClassifier::from_config(config)
        .classify(&request)
        .await
        .context("classifier failed")?;

    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(())
}

fn cmd_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {path:?}");
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let path = config.stats_path();

    println!("SilverGuard Status");
    println!("==================");
    println!();

    match read_persisted(&path).with_context(|| format!("failed to read {path:?}"))? {
        Some(persisted) => {
            println!("{}", persisted.totals);
            println!();
            println!("Last updated: {}", persisted.last_updated);
        }
        None => println!("No statistics recorded yet ({path:?})."),
    }
    Ok(())
}
