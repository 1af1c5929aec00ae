use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use feed_media_archiver::archiver::Orchestrator;
use feed_media_archiver::config::Config;
use feed_media_archiver::source::{collect_media_items, load_posts_file};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting feed-media-archiver");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // The posts file comes from the first argument, falling back to INPUT_PATH.
    let input_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| config.input_path.clone())
        .context("No posts file given (pass a path or set INPUT_PATH)")?;

    info!(
        source = %config.source_id,
        input = %input_path.display(),
        output_dir = %config.output_dir.display(),
        workers = config.worker_concurrency,
        requests_per_second = config.requests_per_second,
        "Configuration loaded"
    );

    let posts = load_posts_file(&input_path).await?;
    let report = collect_media_items(posts);
    for (kind, count) in &report.unsupported {
        warn!(kind = %kind, count, "Posts with unsupported shape were not archived");
    }

    let orchestrator = Orchestrator::from_config(config).await?;

    let cancel = orchestrator.cancellation_token();
    let signal_handle = tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested; finishing in-flight items");
        cancel.cancel();
    });

    let stats = orchestrator.run_items(report.items).await?;
    signal_handle.abort();

    println!("{stats}");
    if stats.cancelled {
        info!("Run was interrupted; rerun to resume");
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,feed_media_archiver=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
