use std::path::PathBuf;

use thiserror::Error;

/// Raw decoded frame handed to the detector and the review pipeline.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open video source {path:?}")]
    Open { path: PathBuf },
    #[error("failed to probe {path:?}: {reason}")]
    Probe { path: PathBuf, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Seekable reader over a finite, ordered sequence of decoded frames.
///
/// `read` yields the next frame in sequence (or `None` once the source is
/// exhausted); `seek` repositions so the following `read` returns the frame at
/// `index`. Implementations own whatever decoder state they need and release
/// it on drop.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<Option<Frame>, SourceError>;
    fn seek(&mut self, index: u64) -> Result<(), SourceError>;
    fn total_frames(&self) -> u64;
    fn dimensions(&self) -> (i32, i32);
}
