//! Per-session playback thread: decode, detect, annotate, publish.
//!
//! One thread per armed session. The loop asks the session what to do next
//! and sleeps inside that call while paused, so a paused room costs no CPU.

use std::{path::PathBuf, sync::Arc};

use metrics::{counter, gauge, histogram};
use tracing::{debug, error, info, info_span, warn};

use detect_core::Detector;
use video_source::{FfmpegSource, Frame, FrameSource};

use super::{
    annotation,
    data::{DetectionSummary, EndNote, FramePacket},
    error::ReviewError,
    publisher::Publisher,
    registry::SessionRegistry,
    session::{Directive, Session},
    storage::MediaStore,
    telemetry,
};

pub(crate) struct PlaybackDeps {
    pub session: Arc<Session>,
    pub source: Box<dyn FrameSource>,
    pub detector: Arc<dyn Detector>,
    pub publisher: Arc<dyn Publisher>,
    pub media: Arc<MediaStore>,
    pub jpeg_quality: u8,
    /// Uploaded file to delete once playback finishes.
    pub video_path: Option<PathBuf>,
}

/// Arm the room's session with a fresh video and spawn its playback thread.
/// A session that is already playing is stopped and joined first. The whole
/// stop-join-spawn-attach sequence runs inside the room's playback slot lock,
/// so concurrent starts (or a racing leave) can never leave two live loops on
/// one session.
#[allow(clippy::too_many_arguments)]
pub(crate) fn start_session(
    registry: &SessionRegistry,
    room: &str,
    video: &std::path::Path,
    diagnosis: &str,
    save_footage: bool,
    detector: Arc<dyn Detector>,
    publisher: Arc<dyn Publisher>,
    media: Arc<MediaStore>,
    jpeg_quality: u8,
) -> Result<(), ReviewError> {
    registry.with_playback_slot(room, |session, handle_slot| {
        if let Some(handle) = handle_slot.take() {
            session.stop();
            if handle.join().is_err() {
                warn!(room, "previous playback thread panicked");
            }
        }

        let source = FfmpegSource::open(video).map_err(|err| {
            ReviewError::Startup(format!("failed to open {}: {err}", video.display()))
        })?;
        let info = source.info();
        session.set_video(
            info.total_frames,
            info.width,
            info.height,
            diagnosis,
            save_footage,
        );
        info!(
            room,
            video = %video.display(),
            frames = info.total_frames,
            width = info.width,
            height = info.height,
            "session armed"
        );

        let deps = PlaybackDeps {
            session: session.clone(),
            source: Box::new(source),
            detector,
            publisher,
            media,
            jpeg_quality,
            video_path: Some(video.to_path_buf()),
        };
        let handle = telemetry::spawn_thread(format!("playback-{room}"), move || run_loop(deps))
            .map_err(|err| {
                ReviewError::Startup(format!("failed to spawn playback thread: {err}"))
            })?;
        *handle_slot = Some(handle);
        Ok(())
    })?
}

pub(crate) fn run_loop(mut deps: PlaybackDeps) {
    let room = deps.session.room().to_string();
    let span = info_span!("playback", room = %room);
    let _guard = span.enter();

    gauge!("review_active_sessions").increment(1.0);

    // Next index the sequential decoder will yield. Steps reposition it.
    let mut position: u64 = 0;
    let total = deps.session.total_frames();

    loop {
        match deps.session.next_directive() {
            Directive::Halt => {
                debug!("halt requested");
                break;
            }
            Directive::StepBackward => {
                let target = deps.session.cursor().saturating_sub(1);
                if !step_to(&mut deps, target, &mut position) {
                    break;
                }
            }
            Directive::StepForward => {
                if total == 0 {
                    break;
                }
                let target = (deps.session.cursor() + 1).min(total - 1);
                if !step_to(&mut deps, target, &mut position) {
                    break;
                }
            }
            Directive::Advance => match deps.source.read() {
                Ok(Some(frame)) => {
                    let index = position;
                    position += 1;
                    process_frame(&deps, frame, index);
                    deps.session.set_cursor(index);
                }
                Ok(None) => {
                    info!("video exhausted");
                    break;
                }
                Err(err) => {
                    error!(error = %err, "frame decode failed");
                    break;
                }
            },
        }
    }

    finish(&deps, &room);
}

fn step_to(deps: &mut PlaybackDeps, target: u64, position: &mut u64) -> bool {
    if let Err(err) = deps.source.seek(target) {
        error!(target, error = %err, "seek failed");
        return false;
    }
    match deps.source.read() {
        Ok(Some(frame)) => {
            process_frame(deps, frame, target);
            deps.session.set_cursor(target);
            *position = target + 1;
            true
        }
        Ok(None) => {
            info!(target, "video exhausted during step");
            false
        }
        Err(err) => {
            error!(target, error = %err, "frame decode failed during step");
            false
        }
    }
}

fn process_frame(deps: &PlaybackDeps, frame: Frame, index: u64) {
    let started = std::time::Instant::now();

    let batch = match deps.detector.infer(&frame) {
        Ok(batch) => batch,
        Err(err) => {
            warn!(index, error = %err, "detector failed, skipping frame");
            counter!("review_detector_errors_total").increment(1);
            return;
        }
    };
    let summaries: Vec<DetectionSummary> =
        batch.detections.iter().map(DetectionSummary::from).collect();

    let jpeg = match annotation::render_annotated_jpeg(&frame, &summaries, index, deps.jpeg_quality)
    {
        Ok(jpeg) => jpeg,
        Err(err) => {
            warn!(index, error = %err, "annotation failed, skipping frame");
            return;
        }
    };

    if deps.session.save_footage() && !summaries.is_empty() {
        if let Err(err) = deps.media.save_footage(&jpeg) {
            warn!(index, error = %err, "failed to save footage still");
        }
    }

    let timestamp_ms = frame.timestamp_ms;
    deps.session.store_result(frame, batch.detections);
    deps.publisher.publish(
        deps.session.room(),
        FramePacket {
            jpeg,
            detections: summaries,
            frame_index: index,
            timestamp_ms,
        },
    );

    counter!("review_frames_published_total").increment(1);
    histogram!("review_frame_seconds").record(started.elapsed().as_secs_f64());
}

fn finish(deps: &PlaybackDeps, room: &str) {
    if deps.session.save_footage() {
        deps.publisher.finish(
            room,
            EndNote {
                room: room.to_string(),
                diagnosis: deps.session.diagnosis(),
            },
        );
    }
    if let Some(path) = &deps.video_path {
        if let Err(err) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %err, "failed to delete uploaded video");
        }
    }
    deps.session.stop();
    gauge!("review_active_sessions").decrement(1.0);
    info!(room, "playback finished");
}
