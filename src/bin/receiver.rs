//! Acquisition Receiver Application
//!
//! Binds the sample stream port, runs acquisition and drains the ring buffer
//! once per processing cycle the way a host pipeline would.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gemini_bridge::{
    config::PersistedParameters, AcquisitionEngine, Configuration, DataSource, DrainedBlock,
};

/// Processing cycle of the simulated host pipeline
const CYCLE: Duration = Duration::from_millis(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting acquisition receiver");

    // Restore persisted parameters through the validating setters
    let settings_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(PersistedParameters::default_path);
    let mut config = Configuration::default();
    if let Some(path) = settings_path.as_ref().filter(|p| p.exists()) {
        match PersistedParameters::load(path) {
            Ok(saved) => {
                for rejected in config.restore(&saved) {
                    tracing::warn!("Ignoring persisted value: {}", rejected);
                }
                tracing::info!("Loaded parameters from {}", path.display());
            }
            Err(e) => tracing::warn!("Failed to load {}: {}", path.display(), e),
        }
    }

    tracing::info!(
        "Port {}, {} Hz, {} channels x {} samples per datagram",
        config.port(),
        config.sample_rate_hz(),
        config.channel_count(),
        config.samples_per_frame()
    );

    let mut engine = AcquisitionEngine::new(config);
    engine.connect()?;
    engine.start_acquisition()?;

    let mut block = DrainedBlock::new();
    let mut drained: u64 = 0;
    let mut last_index: Option<u64> = None;
    let mut gaps: u64 = 0;

    let mut cycle = tokio::time::interval(CYCLE);
    let mut stats_timer = tokio::time::interval(Duration::from_secs(5));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!("Waiting for samples - press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = cycle.tick() => {
                let n = engine.drain_into(&mut block, usize::MAX);
                if n > 0 {
                    if let (Some(prev), Some(&first)) = (last_index, block.sample_indices.first()) {
                        if first != prev + 1 {
                            gaps += 1;
                        }
                    }
                    last_index = block.sample_indices.last().copied();
                    drained += n as u64;
                }
            }
            _ = stats_timer.tick() => {
                let stats = engine.stats();
                tracing::info!(
                    "{} samples drained, {} index gaps, stats: {}",
                    drained,
                    gaps,
                    serde_json::to_string(&stats)?
                );
                if engine.error_flag() {
                    tracing::warn!("Status: {}", engine.status_message());
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested");
                break;
            }
        }
    }

    engine.stop_acquisition();
    engine.disconnect();

    if let Some(path) = settings_path {
        if let Err(e) = engine.config().persisted().save(&path) {
            tracing::warn!("Failed to save parameters to {}: {}", path.display(), e);
        }
    }

    Ok(())
}
