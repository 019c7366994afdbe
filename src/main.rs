use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use media_worker::app::{create_health_app, create_worker};
use media_worker::config::{AppConfig, LogFormat};
use media_worker::media::{FfmpegTranscoder, TranscodeProgress, TranscoderConfig};
use media_worker::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let config = AppConfig::new().context("Invalid configuration")?;
    init_tracing(config.log_format);

    info!("Starting media worker...");

    let (progress_tx, progress_rx) = mpsc::channel(32);
    tokio::spawn(log_progress(progress_rx));

    let transcoder = FfmpegTranscoder::new(TranscoderConfig {
        ffmpeg_path: config.ffmpeg_path.clone(),
        ffprobe_path: config.ffprobe_path.clone(),
        timeout: config.transcode_timeout,
        ..TranscoderConfig::default()
    })
    .with_progress_sender(progress_tx);
    transcoder.validate().await.context("ffmpeg is not usable")?;

    let health_port = config.health_port;
    let state = AppState::connect(config).await?;
    let worker = create_worker(&state, Arc::new(transcoder));

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    if health_port != 0 {
        let app = create_health_app(worker.stats());
        let addr = SocketAddr::from(([0, 0, 0, 0], health_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Health endpoint on http://{}/health", addr);

        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await });
            if let Err(e) = server.await {
                warn!(error = %e, "Health server stopped");
            }
        });
    }

    worker.run(shutdown).await;
    state.db.close().await;
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn log_progress(mut rx: mpsc::Receiver<TranscodeProgress>) {
    while let Some(progress) = rx.recv().await {
        debug!(
            operation = progress.operation.as_str(),
            time_secs = progress.time_secs,
            percent = ?progress.percent(),
            speed = ?progress.speed,
            "Transcode progress"
        );
    }
}

async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown requested; finishing the current job");
    shutdown.cancel();
}
