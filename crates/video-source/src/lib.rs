//! Frame-source boundary for the review server.
//!
//! A [`FrameSource`] is a finite, seekable sequence of decoded frames. The
//! shipped implementation decodes through an ffmpeg subprocess; test code and
//! alternative decoders only need to satisfy the trait.

mod ffmpeg;
mod types;

pub use ffmpeg::{FfmpegSource, VideoInfo, probe};
pub use types::{Frame, FrameFormat, FrameSource, SourceError};
