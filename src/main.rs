//! Streamsource demo: a stand-in engine pulling from a custom media source

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use streamsource::engine::{Engine, PullEvent};
use streamsource::pipeline::VideoSample;
use streamsource::source::relay::RelayFeeder;
use streamsource::source::{AudioFrame, StreamDataSource, SyntheticSource, VideoFrame};
use streamsource::{utils, Config};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamsource=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Streamsource launching...");

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    streamsource::CONFIG.store(Arc::new(config.clone()));

    let built = utils::build_configured_source()?;
    let source_id = built.source.id();

    // Relay mode: an application-side producer pushes test pattern samples
    let producer = built.feeder.map(|feeder| {
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = feed_relay(feeder, &config).await {
                error!("Relay producer failed: {}", e);
            }
        })
    });

    let (tx, rx) = flume::bounded::<PullEvent>(config.engine.event_queue.max(1));
    let engine = Engine::new(&config)?.with_events(tx);
    let sessions = engine.sessions().clone();

    // Log a sample of pull events without ever blocking the pull threads
    let logger = tokio::spawn(async move {
        let mut seen = 0u64;
        while let Ok(event) = rx.recv_async().await {
            seen += 1;
            if seen % 30 == 1 {
                debug!(?event, seen, "pull event");
            }
        }
    });

    let driver = engine.attach(built.source, "demo")?;

    let run = async {
        if config.engine.run_secs == 0 {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(Duration::from_secs(config.engine.run_secs)).await
        }
    };
    tokio::select! {
        _ = run => info!("Run time elapsed"),
        r = tokio::signal::ctrl_c() => {
            r?;
            info!("Interrupted");
        }
    }

    let stats = tokio::task::spawn_blocking(move || driver.stop()).await?;
    info!(?stats, "Pulling stopped");

    if let Some(producer) = producer {
        producer.abort();
    }
    // Last reference went with the driver; the destroy handler has run.
    if sessions.contains(source_id) {
        warn!(%source_id, "source still registered after teardown");
    } else {
        info!(released = ?sessions.released(), "Source destroyed");
    }

    drop(engine);
    logger.await?;

    info!("Streamsource shutting down");
    Ok(())
}

/// Push synthetic frames into a relay at the configured cadence.
async fn feed_relay(mut feeder: RelayFeeder, config: &Config) -> Result<()> {
    let generator = SyntheticSource::new(config.video.clone(), config.audio.clone())?;
    generator.on_start();

    let mut video_buf = vec![0u8; generator.frame_len()];
    let mut audio_buf = vec![0u8; config.audio.chunk_len()];
    let mut video_tick = tokio::time::interval(config.video.frame_interval());
    let mut audio_tick = tokio::time::interval(config.audio.frame_interval());

    loop {
        tokio::select! {
            _ = video_tick.tick() => {
                if !feeder.is_active() {
                    continue;
                }
                let mut frame = VideoFrame::new(&mut video_buf);
                let n = generator
                    .on_request_video_frame(&mut frame)
                    .map_err(|e| eyre!("generator: {}", e))?;
                let sample = VideoSample {
                    data: Bytes::copy_from_slice(&frame.data[..n]),
                    format: frame.pixel_format,
                    width: frame.width,
                    height: frame.height,
                    timestamp_ms: frame.timestamp_ms,
                    rotation: frame.rotation,
                };
                if !feeder.push_video(sample)? {
                    debug!("Relay stopped before the frame was queued");
                }
            }
            _ = audio_tick.tick() => {
                if !feeder.is_active() {
                    continue;
                }
                let mut frame = AudioFrame::new(&mut audio_buf);
                if let Ok(n) = generator.on_request_audio_frame(&mut frame) {
                    feeder.push_audio(&frame.data[..n]);
                }
            }
        }
    }
}
