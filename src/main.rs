//! netpulse - network performance probe daemon.
//!
//! `netpulse` runs the scheduler until Ctrl-C; `netpulse once` runs every
//! target a single time and exits non-zero only if all of them failed.

use std::process::ExitCode;
use std::sync::Arc;

use netpulse::{AppConfig, HttpUploader, LogUploader, Scheduler, Uploader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("netpulse failed: {}", e);
            eprintln!("netpulse: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode, BoxError> {
    let once = match std::env::args().nth(1).as_deref() {
        None => false,
        Some("once") => true,
        Some(other) => return Err(format!("unknown command {:?} (expected \"once\")", other).into()),
    };

    let cfg = AppConfig::load()?;

    // Initialize logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(cfg.log_directive()))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    cfg.report_target_problems();

    let uploader: Arc<dyn Uploader> = match cfg.upload.url.as_deref() {
        Some(url) if !url.is_empty() => {
            let uploader = HttpUploader::new(url, cfg.upload.api_key.clone())?;
            tracing::info!("Uploading results to {}", uploader.endpoint());
            Arc::new(uploader)
        }
        _ => {
            tracing::info!("No upload URL configured; logging results only");
            Arc::new(LogUploader)
        }
    };

    let scheduler = Scheduler::new(cfg.targets(), cfg.schedule.options(), cfg.identity(), uploader);

    if once {
        let run = scheduler.trigger_now().await?;
        scheduler.stop().await;
        return Ok(if run.all_failed() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        });
    }

    scheduler
        .start(cfg.schedule.interval(), cfg.schedule.run_on_startup)
        .await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    scheduler.stop().await;

    let state = scheduler.snapshot().await;
    tracing::info!(
        runs = state.run_counter,
        succeeded = state.succeeded,
        failed = state.failed,
        cancelled = state.cancelled,
        upload_failures = state.upload_failures,
        "netpulse stopped"
    );
    Ok(ExitCode::SUCCESS)
}
