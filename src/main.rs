//! Frame coordinator demo - Main Entry Point
//!
//! Runs a synthetic capture session through the default pipeline:
//! `frame-coordinator [config.toml|config.json]`. Without an argument the
//! config is read from the platform default location, falling back to
//! defaults.

use anyhow::Context;
use frame_coordinator::{
    buffer::{BufferPool, BufferSpec, HeapAllocator, ImageFormat},
    capture::{CaptureSource, SyntheticCaptureSource},
    CoordinatorConfig, FrameCoordinator, SensorId, SwitchResult,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Frames captured by the demo session
const SESSION_FRAMES: u64 = 120;

/// Switch to the other sensor every this many frames
const SWITCH_INTERVAL: u64 = 40;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,frame_coordinator=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting frame coordinator demo");

    let config = match std::env::args_os().nth(1) {
        Some(path) => CoordinatorConfig::load(&path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => match CoordinatorConfig::default_path() {
            Some(path) if path.exists() => CoordinatorConfig::load_or_default(path),
            _ => CoordinatorConfig::default(),
        },
    };

    let coordinator = FrameCoordinator::builder(config.clone())
        .build()
        .context("Failed to build coordinator")?;
    coordinator.start()?;

    let spec = BufferSpec::new("sensor", ImageFormat::Raw10, 1920, 1080).continuous(true);
    let pool = BufferPool::new(spec, 8, Arc::new(HeapAllocator::new()))?;
    let fps = config.scenario.startup.map(|s| s.fps).unwrap_or(30);
    let mut source = SyntheticCaptureSource::new(pool, config.sensor_path.initial, fps)
        .with_limit(SESSION_FRAMES)
        .with_group_size(4);

    let results = coordinator.results();
    let mut captured = 0u64;
    loop {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Capture skipped a frame: {}", e);
                coordinator.wait_idle(Duration::from_millis(100));
                continue;
            }
        };
        captured += 1;
        if captured % SWITCH_INTERVAL == 0 {
            let target = match coordinator.current_state().sensor {
                SensorId::Wide => SensorId::Tele,
                SensorId::Tele => SensorId::Wide,
            };
            let decision = coordinator.switch_sensor(target);
            if decision.transition.changed() {
                coordinator.notify_switch_result(target, SwitchResult::Accept);
            }
            // The frame in hand still belongs to the vacated path.
            source.set_sensor(target);
        }

        if let Err(e) = coordinator.submit_frame(frame) {
            tracing::warn!("{}", e);
        }

        // Let the pipeline return sensor buffers before the next capture.
        for result in results.try_iter() {
            tracing::debug!(
                "request #{} (frame {}, {}{}) done in {:?}",
                result.request_no,
                result.frame_number,
                result.sensor,
                if result.drain { ", drain" } else { "" },
                result.latency
            );
        }
        coordinator.wait_idle(Duration::from_millis(100));
    }

    if !coordinator.wait_idle(Duration::from_secs(2)) {
        tracing::warn!("Pipeline still busy after capture ended");
    }
    let late = results.try_iter().count();
    tracing::info!(
        "Session finished: {} frames captured, {} results after capture",
        captured,
        late
    );

    coordinator.shutdown()?;
    println!("{}", serde_json::to_string_pretty(&coordinator.stats())?);

    Ok(())
}
