//! Session-based video review: decode uploads, run detection, stream
//! annotated frames to named rooms, and turn reviewer corrections into
//! training labels.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `session`: Per-room transport state machine (pause/step/stop).
//! - `playback`: The decode → detect → annotate → publish loop.
//! - `registry`: Room name to session bookkeeping.
//! - `publisher`: Latest-frame mailboxes consumed by the HTTP feeds.
//! - `feedback`: Correction encoding into YOLO-style label files.
//! - `counter`: Crash-safe shared index for feedback pairs.
//! - `storage`: Uploads, footage stills, and the zip export.
//! - `annotation`: Drawing primitives and JPEG encoding.
//! - `server`: Actix Web control and streaming endpoints.
//! - `data`: Shared structs passed between stages.

/// Re-export the configuration so callers can start the service without
/// reaching into submodules.
pub use config::ReviewConfig;

mod annotation;
mod config;
mod counter;
mod data;
mod error;
mod feedback;
mod playback;
mod publisher;
mod registry;
mod server;
mod session;
mod storage;
pub(crate) mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use detect_core::{Detector, NullDetector};

use counter::CounterStore;
use feedback::FeedbackEncoder;
use publisher::RoomHub;
use registry::SessionRegistry;
use storage::MediaStore;

/// Start the review service and block until the HTTP server exits.
pub fn run(config: ReviewConfig) -> Result<()> {
    telemetry::init_metrics_recorder();

    std::fs::create_dir_all(&config.uploads_dir)
        .with_context(|| format!("failed to create {}", config.uploads_dir.display()))?;
    std::fs::create_dir_all(&config.feedback_dir)
        .with_context(|| format!("failed to create {}", config.feedback_dir.display()))?;
    std::fs::create_dir_all(&config.footage_dir)
        .with_context(|| format!("failed to create {}", config.footage_dir.display()))?;

    let detector = build_detector(&config)?;
    let counter = Arc::new(CounterStore::new(config.feedback_dir.join("count_frames.txt")));
    let feedback = Arc::new(FeedbackEncoder::new(&config, counter));
    let media = Arc::new(MediaStore::new(
        config.uploads_dir.clone(),
        config.footage_dir.clone(),
    ));

    let state = Arc::new(server::ServerState {
        registry: Arc::new(SessionRegistry::default()),
        hub: Arc::new(RoomHub::default()),
        detector,
        media,
        feedback,
        config: config.clone(),
    });

    let host = state.config.host.clone();
    let port = state.config.port;
    let server = server::spawn(state)?;
    info!(host, port, "review server listening");
    server.wait();
    Ok(())
}

#[cfg(feature = "with-tch")]
fn build_detector(config: &ReviewConfig) -> Result<Arc<dyn Detector>> {
    use detect_core::TorchDetector;

    match &config.model_path {
        Some(path) => {
            let device = detect_core::tch::Device::cuda_if_available();
            let detector = TorchDetector::new(path, device, (640, 640))
                .with_context(|| format!("failed to load model {}", path.display()))?
                .with_confidence_threshold(config.confidence);
            info!(model = %path.display(), "torch detector loaded");
            Ok(Arc::new(detector))
        }
        None => {
            warn!("no model configured, frames will pass through undetected");
            Ok(Arc::new(NullDetector))
        }
    }
}

#[cfg(not(feature = "with-tch"))]
fn build_detector(config: &ReviewConfig) -> Result<Arc<dyn Detector>> {
    if let Some(path) = &config.model_path {
        warn!(
            model = %path.display(),
            "built without the with-tch feature, ignoring model and passing frames through"
        );
    }
    Ok(Arc::new(NullDetector))
}
