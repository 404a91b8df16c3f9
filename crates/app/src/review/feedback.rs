//! Turns reviewer corrections into YOLO-style training labels.
//!
//! Each submission persists the raw frame under `images/` and one label file
//! under `labels/`, then replicates the pair four times so corrected samples
//! outweigh the bulk dataset during retraining. Detector boxes are normalized
//! against the frame; reviewer boxes arrive in browser canvas coordinates and
//! are shifted out of the page chrome before normalizing against the canvas.

use std::{
    fmt::Write as _,
    fs,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, anyhow};
use metrics::counter;
use serde::Deserialize;
use tracing::info;

use detect_core::Detection;

use super::{
    annotation,
    config::ReviewConfig,
    counter::CounterStore,
    error::ReviewError,
    session::Session,
};

/// Replicas written per submission, on top of the original pair.
const REPLICA_COUNT: u64 = 4;

#[derive(Debug, Deserialize)]
pub(crate) struct FeedbackPayload {
    #[serde(default)]
    pub boxes: Vec<CorrectionBox>,
    pub size: CanvasSize,
    #[serde(rename = "windowSize")]
    pub window_size: CanvasSize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CorrectionBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub label: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CanvasSize {
    pub width: f64,
    pub height: f64,
}

pub(crate) struct FeedbackEncoder {
    images: PathBuf,
    labels: PathBuf,
    counter: Arc<CounterStore>,
    canvas_margin: f64,
    class_map: Vec<(String, i64)>,
    default_class: i64,
    jpeg_quality: u8,
}

impl FeedbackEncoder {
    pub(crate) fn new(config: &ReviewConfig, counter: Arc<CounterStore>) -> Self {
        Self {
            images: config.feedback_dir.join("images"),
            labels: config.feedback_dir.join("labels"),
            counter,
            canvas_margin: config.canvas_margin,
            class_map: config.class_map.clone(),
            default_class: config.default_class,
            jpeg_quality: config.jpeg_quality,
        }
    }

    fn class_for(&self, label: &str) -> i64 {
        self.class_map
            .iter()
            .find(|(name, _)| name == label)
            .map(|(_, id)| *id)
            .unwrap_or(self.default_class)
    }

    /// Persist the session's last published frame plus its labels, returning
    /// the index of the original pair.
    pub(crate) fn submit(
        &self,
        session: &Session,
        payload: &FeedbackPayload,
    ) -> Result<u64, ReviewError> {
        let snapshot = session
            .snapshot()
            .ok_or_else(|| anyhow!("no frame has been published for room {}", session.room()))?;

        fs::create_dir_all(&self.images)
            .with_context(|| format!("failed to create {}", self.images.display()))
            .map_err(persistence)?;
        fs::create_dir_all(&self.labels)
            .with_context(|| format!("failed to create {}", self.labels.display()))
            .map_err(persistence)?;

        let index = self.counter.next().map_err(persistence)?;
        let image_path = self.images.join(format!("{index}.jpg"));
        let label_path = self.labels.join(format!("{index}.txt"));

        let jpeg = annotation::encode_frame_jpeg(&snapshot.frame, self.jpeg_quality)?;
        fs::write(&image_path, jpeg)
            .with_context(|| format!("failed to write {}", image_path.display()))
            .map_err(persistence)?;

        let mut lines = String::new();
        for detection in &snapshot.detections {
            lines.push_str(&detection_line(
                detection,
                snapshot.width as f64,
                snapshot.height as f64,
            ));
            lines.push('\n');
        }
        for correction in &payload.boxes {
            lines.push_str(&self.correction_line(correction, payload));
            lines.push('\n');
        }
        // Written even when empty: a negative sample still needs its label
        // file so the pair can be replicated and consumed by training.
        fs::write(&label_path, &lines)
            .with_context(|| format!("failed to write {}", label_path.display()))
            .map_err(persistence)?;

        for _ in 0..REPLICA_COUNT {
            let replica = self.counter.next().map_err(persistence)?;
            fs::copy(&image_path, self.images.join(format!("{replica}.jpg")))
                .with_context(|| format!("failed to replicate {}", image_path.display()))
                .map_err(persistence)?;
            fs::copy(&label_path, self.labels.join(format!("{replica}.txt")))
                .with_context(|| format!("failed to replicate {}", label_path.display()))
                .map_err(persistence)?;
        }

        counter!("review_feedback_submissions_total").increment(1);
        info!(
            room = session.room(),
            index,
            detections = snapshot.detections.len(),
            corrections = payload.boxes.len(),
            "stored feedback pair"
        );
        Ok(index)
    }

    fn correction_line(&self, bbox: &CorrectionBox, payload: &FeedbackPayload) -> String {
        let adj_x = payload.window_size.width - payload.size.width - self.canvas_margin;
        let adj_y = (payload.window_size.height - payload.size.height) / 2.0;
        let center_x = (bbox.x - adj_x + bbox.width / 2.0) / payload.size.width;
        let center_y = (bbox.y - adj_y + bbox.height / 2.0) / payload.size.height;
        let w = bbox.width / payload.size.width;
        let h = bbox.height / payload.size.height;
        label_line(self.class_for(&bbox.label), center_x, center_y, w, h)
    }
}

fn persistence(err: anyhow::Error) -> ReviewError {
    ReviewError::Persistence(format!("{err:#}"))
}

fn detection_line(detection: &Detection, frame_w: f64, frame_h: f64) -> String {
    let [x1, y1, x2, y2] = detection.bbox;
    let center_x = f64::from(x1 + x2) / 2.0 / frame_w;
    let center_y = f64::from(y1 + y2) / 2.0 / frame_h;
    let w = f64::from(x2 - x1) / frame_w;
    let h = f64::from(y2 - y1) / frame_h;
    label_line(detection.class_id, center_x, center_y, w, h)
}

fn label_line(class_id: i64, center_x: f64, center_y: f64, w: f64, h: f64) -> String {
    let mut line = String::new();
    let _ = write!(
        line,
        "{} {} {} {} {}",
        class_id,
        round6(center_x),
        round6(center_y),
        round6(w),
        round6(h)
    );
    line
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_source::{Frame, FrameFormat};

    fn config_for(dir: &std::path::Path) -> ReviewConfig {
        let mut config = ReviewConfig::default();
        config.feedback_dir = dir.join("feedback");
        config
    }

    fn encoder_for(dir: &std::path::Path) -> FeedbackEncoder {
        let config = config_for(dir);
        let counter = Arc::new(CounterStore::new(config.feedback_dir.join("count_frames.txt")));
        FeedbackEncoder::new(&config, counter)
    }

    fn session_with_frame(detections: Vec<Detection>) -> Session {
        let session = Session::new("demo");
        session.set_video(10, 640, 480, "Adenomatous", false);
        let frame = Frame {
            data: vec![10u8; 640 * 480 * 3],
            width: 640,
            height: 480,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        };
        session.store_result(frame, detections);
        session
    }

    fn empty_payload() -> FeedbackPayload {
        FeedbackPayload {
            boxes: Vec::new(),
            size: CanvasSize {
                width: 640.0,
                height: 480.0,
            },
            window_size: CanvasSize {
                width: 730.0,
                height: 580.0,
            },
        }
    }

    #[test]
    fn detection_normalizes_to_frame_dimensions() {
        let detection = Detection {
            bbox: [100.0, 100.0, 300.0, 300.0],
            score: 0.9,
            class_id: 0,
        };
        assert_eq!(
            detection_line(&detection, 640.0, 480.0),
            "0 0.3125 0.416667 0.3125 0.416667"
        );
    }

    #[test]
    fn correction_uses_canvas_geometry_and_class_map() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder_for(dir.path());
        let payload = FeedbackPayload {
            boxes: vec![CorrectionBox {
                x: 140.0,
                y: 150.0,
                width: 200.0,
                height: 200.0,
                label: "Adenomatous".into(),
            }],
            ..empty_payload()
        };
        // adj_x = 730 - 640 - 50 = 40, adj_y = (580 - 480) / 2 = 50, so the
        // box lands at canvas (100, 100) and matches the detection above.
        assert_eq!(
            encoder.correction_line(&payload.boxes[0], &payload),
            "2 0.3125 0.416667 0.3125 0.416667"
        );
    }

    #[test]
    fn unknown_label_maps_to_default_class() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder_for(dir.path());
        assert_eq!(encoder.class_for("Hyperplastic"), 0);
        assert_eq!(encoder.class_for("Adenomatous"), 2);
    }

    #[test]
    fn submit_writes_five_pairs_and_advances_counter() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder_for(dir.path());
        let session = session_with_frame(vec![Detection {
            bbox: [100.0, 100.0, 300.0, 300.0],
            score: 0.9,
            class_id: 0,
        }]);

        let index = encoder.submit(&session, &empty_payload()).unwrap();
        assert_eq!(index, 1);

        let feedback = dir.path().join("feedback");
        for i in 1..=5u64 {
            assert!(feedback.join("images").join(format!("{i}.jpg")).exists());
            let labels = fs::read_to_string(feedback.join("labels").join(format!("{i}.txt")))
                .unwrap();
            assert_eq!(labels, "0 0.3125 0.416667 0.3125 0.416667\n");
        }
        assert_eq!(
            fs::read_to_string(feedback.join("count_frames.txt")).unwrap(),
            "5"
        );
    }

    #[test]
    fn submit_without_boxes_still_creates_label_file() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder_for(dir.path());
        let session = session_with_frame(Vec::new());

        encoder.submit(&session, &empty_payload()).unwrap();
        let labels = dir.path().join("feedback").join("labels");
        assert_eq!(fs::read_to_string(labels.join("1.txt")).unwrap(), "");
    }

    #[test]
    fn write_failures_surface_as_persistence_errors() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder_for(dir.path());
        let session = session_with_frame(Vec::new());

        // Occupy the first label path with a directory so the write fails.
        let labels = dir.path().join("feedback").join("labels");
        fs::create_dir_all(labels.join("1.txt")).unwrap();

        let err = encoder.submit(&session, &empty_payload()).unwrap_err();
        assert!(matches!(err, ReviewError::Persistence(_)));
    }

    #[test]
    fn submit_without_frame_fails() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = encoder_for(dir.path());
        let session = Session::new("demo");
        assert!(encoder.submit(&session, &empty_payload()).is_err());
    }
}
