use std::sync::{Arc, Mutex};

use detect_core::Detection;
use serde::Serialize;

/// Encoded frame ready for broadcast to a room's subscribers.
#[derive(Clone)]
pub(crate) struct FramePacket {
    pub(crate) jpeg: Vec<u8>,
    pub(crate) detections: Vec<DetectionSummary>,
    pub(crate) frame_index: u64,
    pub(crate) timestamp_ms: i64,
}

#[derive(Clone, Serialize)]
pub(crate) struct DetectionSummary {
    pub(crate) class_id: i64,
    pub(crate) score: f32,
    pub(crate) bbox: [f32; 4],
}

impl From<&Detection> for DetectionSummary {
    fn from(det: &Detection) -> Self {
        Self {
            class_id: det.class_id,
            score: det.score,
            bbox: det.bbox,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct DetectionsResponse<'a> {
    pub(crate) frame_index: u64,
    pub(crate) timestamp_ms: i64,
    pub(crate) detections: &'a [DetectionSummary],
}

/// Terminal notification emitted when a saving session completes.
#[derive(Clone, Serialize)]
pub(crate) struct EndNote {
    pub(crate) room: String,
    pub(crate) diagnosis: String,
}

pub(crate) type SharedPacket = Arc<Mutex<Option<FramePacket>>>;
