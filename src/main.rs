use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use open_music_engine::{
    audio::registry::{EngineRegistry, EngineSettings},
    config::Config,
    sources::FfmpegEncoder,
    storage::JsonQueueStore,
    transport::PcmFileTransport,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_engine=debug".parse()?),
        )
        .init();

    info!("🎵 Starting Open Music Engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;

    // Handle health check if requested
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    // Collaborators: JSON storage, ffmpeg encoder and PCM capture
    let store = Arc::new(JsonQueueStore::new(config.data_dir.clone()).await?);
    let encoder = Arc::new(FfmpegEncoder::new(config.encoder.clone()));
    let transport = Arc::new(PcmFileTransport::new(config.data_dir.join("capture")).await?);

    let registry = Arc::new(EngineRegistry::new(
        store,
        encoder,
        transport,
        EngineSettings::from(&config),
    ));

    // Restore saved queues
    registry.rehydrate_all().await?;

    let reaper = registry
        .clone()
        .spawn_idle_reaper(config.reaper_interval(), config.idle_timeout());

    info!("🚀 Engine ready, waiting for Ctrl+C");
    tokio::signal::ctrl_c().await?;
    info!("⚠️ Shutdown signal received, closing...");

    reaper.abort();
    registry.shutdown().await;

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    // Check critical dependencies
    let yt_dlp = async_process::Command::new(&config.encoder.ytdlp_path)
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new(&config.encoder.ffmpeg_path)
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Missing dependencies");
    }
}
