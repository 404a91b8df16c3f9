//! Detector boundary for the review server.
//!
//! The playback loop only sees the [`Detector`] trait. Enable the `with-tch`
//! feature to pull in the TorchScript-backed implementation.

pub mod detector;

pub use detector::{Detection, DetectionBatch, Detector, NullDetector};

#[cfg(feature = "with-tch")]
pub use detector::TorchDetector;
#[cfg(feature = "with-tch")]
pub use tch;
