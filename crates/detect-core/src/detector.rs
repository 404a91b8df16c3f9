use anyhow::Result;
use video_source::Frame;

/// Single detection in frame pixel space, corners as (x1, y1, x2, y2).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: i64,
}

/// All detections produced for one frame.
#[derive(Debug, Clone, Default)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
}

/// Inference boundary consumed by the playback loop.
///
/// Implementations must tolerate being shared across sessions; a detector is
/// loaded once and called from every playback thread.
pub trait Detector: Send + Sync {
    fn infer(&self, frame: &Frame) -> Result<DetectionBatch>;
}

/// Detector used when no model is configured; reports no detections so the
/// rest of the pipeline (playback, feedback, export) stays exercisable.
pub struct NullDetector;

impl Detector for NullDetector {
    fn infer(&self, _frame: &Frame) -> Result<DetectionBatch> {
        Ok(DetectionBatch::default())
    }
}

#[cfg(feature = "with-tch")]
pub use torch::TorchDetector;

#[cfg(feature = "with-tch")]
mod torch {
    use std::path::Path;

    use anyhow::Result;
    use tch::{Device, Kind, Tensor};
    use video_source::{Frame, FrameFormat};

    use super::{Detection, DetectionBatch, Detector};

    /// TorchScript-backed detector wrapper.
    pub struct TorchDetector {
        module: tch::CModule,
        device: Device,
        input_size: (i64, i64),
        confidence_threshold: f32,
    }

    impl TorchDetector {
        /// Load a TorchScript module and prepare it for execution on `device`.
        pub fn new<P: AsRef<Path>>(
            model_path: P,
            device: Device,
            input_size: (i64, i64),
        ) -> Result<Self> {
            let module = tch::CModule::load_on_device(model_path, device)?;
            Ok(Self {
                module,
                device,
                input_size,
                confidence_threshold: 0.25,
            })
        }

        /// Override the confidence threshold used for filtering detections.
        pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
            self.confidence_threshold = confidence;
            self
        }

        /// Convert a BGR8 frame into a normalized RGB tensor sized for the
        /// module, remembering the scale back to frame pixels.
        fn bgr_to_tensor(&self, frame: &Frame) -> Result<(Tensor, f32, f32)> {
            let expected = (frame.width as usize) * (frame.height as usize) * 3;
            if frame.data.len() != expected {
                anyhow::bail!(
                    "unexpected frame buffer size: got {} bytes, expected {expected}",
                    frame.data.len()
                );
            }

            let (in_w, in_h) = self.input_size;
            let tensor = Tensor::from_slice(&frame.data)
                .to_device(self.device)
                .to_kind(Kind::Float)
                .view([1, frame.height as i64, frame.width as i64, 3])
                .flip([3])
                .permute([0, 3, 1, 2])
                / 255.0;
            let tensor = tensor.upsample_bilinear2d([in_h, in_w], false, None, None);

            let scale_x = frame.width as f32 / in_w as f32;
            let scale_y = frame.height as f32 / in_h as f32;
            Ok((tensor, scale_x, scale_y))
        }
    }

    impl Detector for TorchDetector {
        fn infer(&self, frame: &Frame) -> Result<DetectionBatch> {
            if frame.format != FrameFormat::Bgr8 {
                anyhow::bail!("unsupported frame format");
            }
            let (input, scale_x, scale_y) = self.bgr_to_tensor(frame)?;
            let output = self.module.forward_ts(&[input])?;
            let shape = output.size();
            if shape.len() != 3 || shape[0] != 1 {
                anyhow::bail!("unexpected detector output shape: {shape:?}");
            }

            let preds = output
                .to_device(Device::Cpu)
                .squeeze_dim(0)
                .contiguous();
            let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

            let mut detections = Vec::new();
            for row in rows {
                if row.len() < 5 {
                    continue;
                }
                let score = row[4];
                if score < self.confidence_threshold {
                    continue;
                }
                // Rows are (cx, cy, w, h, conf[, class]) in module input space.
                let half_w = row[2] / 2.0;
                let half_h = row[3] / 2.0;
                detections.push(Detection {
                    bbox: [
                        (row[0] - half_w) * scale_x,
                        (row[1] - half_h) * scale_y,
                        (row[0] + half_w) * scale_x,
                        (row[1] + half_h) * scale_y,
                    ],
                    score,
                    class_id: if row.len() > 5 { row[5] as i64 } else { 0 },
                });
                if detections.len() >= 512 {
                    break;
                }
            }

            Ok(DetectionBatch { detections })
        }
    }
}

#[cfg(test)]
mod tests {
    use video_source::{Frame, FrameFormat};

    use super::*;

    #[test]
    fn null_detector_reports_nothing() {
        let frame = Frame {
            data: vec![0u8; 4 * 4 * 3],
            width: 4,
            height: 4,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        };
        let batch = NullDetector.infer(&frame).unwrap();
        assert!(batch.detections.is_empty());
    }
}
