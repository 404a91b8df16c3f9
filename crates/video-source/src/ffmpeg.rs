use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, Stdio},
};

use anyhow::{Context, anyhow};
use chrono::Utc;
use tracing::debug;

use crate::types::{Frame, FrameFormat, FrameSource, SourceError};

/// Stream metadata reported by ffprobe.
#[derive(Clone, Copy, Debug)]
pub struct VideoInfo {
    pub width: i32,
    pub height: i32,
    pub total_frames: u64,
    pub fps: f64,
}

/// Probe a video file for its dimensions, frame count, and frame rate.
pub fn probe(path: &Path) -> Result<VideoInfo, SourceError> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height,nb_frames,r_frame_rate,duration")
        .arg("-of")
        .arg("json")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| SourceError::Probe {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;

    if !output.status.success() {
        return Err(SourceError::Probe {
            path: path.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout)).map_err(|err| {
        SourceError::Probe {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    })
}

fn parse_probe_output(json: &str) -> anyhow::Result<VideoInfo> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let stream = value
        .get("streams")
        .and_then(|streams| streams.get(0))
        .ok_or_else(|| anyhow!("no video stream reported"))?;

    let width = stream
        .get("width")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| anyhow!("stream has no width"))? as i32;
    let height = stream
        .get("height")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| anyhow!("stream has no height"))? as i32;
    if width <= 0 || height <= 0 {
        anyhow::bail!("invalid stream dimensions {width}x{height}");
    }

    let fps = stream
        .get("r_frame_rate")
        .and_then(|v| v.as_str())
        .map(parse_rate)
        .transpose()?
        .unwrap_or(25.0);

    // nb_frames is absent or "N/A" for some containers; fall back to
    // duration * fps which is close enough for cursor clamping.
    let total_frames = stream
        .get("nb_frames")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<u64>().ok())
        .or_else(|| {
            stream
                .get("duration")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .map(|secs| (secs * fps).round() as u64)
        })
        .ok_or_else(|| anyhow!("stream reports neither nb_frames nor duration"))?;

    Ok(VideoInfo {
        width,
        height,
        total_frames,
        fps,
    })
}

fn parse_rate(rate: &str) -> anyhow::Result<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().context("bad frame rate numerator")?;
            let den: f64 = den.trim().parse().context("bad frame rate denominator")?;
            if den == 0.0 {
                anyhow::bail!("zero frame rate denominator");
            }
            Ok(num / den)
        }
        None => rate.trim().parse().context("bad frame rate"),
    }
}

/// File-backed frame source decoding through an ffmpeg subprocess.
///
/// Frames are read sequentially from the child's stdout as raw BGR24 planes.
/// Seeking respawns the decoder at the target timestamp, which is the only
/// random-access primitive the rawvideo pipe offers.
pub struct FfmpegSource {
    path: PathBuf,
    info: VideoInfo,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    next_index: u64,
}

impl FfmpegSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        if !path.exists() {
            return Err(SourceError::Open {
                path: path.to_path_buf(),
            });
        }
        let info = probe(path)?;
        debug!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            frames = info.total_frames,
            fps = info.fps,
            "opened video source"
        );
        Ok(Self {
            path: path.to_path_buf(),
            info,
            child: None,
            stdout: None,
            next_index: 0,
        })
    }

    pub fn info(&self) -> VideoInfo {
        self.info
    }

    fn frame_bytes(&self) -> usize {
        (self.info.width as usize) * (self.info.height as usize) * 3
    }

    fn spawn_decoder(&mut self) -> Result<(), SourceError> {
        self.kill_decoder();

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        if self.next_index > 0 {
            let seconds = self.next_index as f64 / self.info.fps;
            cmd.arg("-ss").arg(format!("{seconds:.6}"));
        }
        cmd.arg("-i")
            .arg(&self.path)
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|err| SourceError::Other(anyhow!("failed to spawn ffmpeg: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

        self.child = Some(child);
        self.stdout = Some(stdout);
        Ok(())
    }

    fn kill_decoder(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl FrameSource for FfmpegSource {
    fn read(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.stdout.is_none() {
            self.spawn_decoder()?;
        }
        let mut buffer = vec![0u8; self.frame_bytes()];
        let stdout = match self.stdout.as_mut() {
            Some(stdout) => stdout,
            None => return Ok(None),
        };
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                self.next_index += 1;
                Ok(Some(Frame {
                    data: buffer,
                    width: self.info.width,
                    height: self.info.height,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format: FrameFormat::Bgr8,
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.kill_decoder();
                Ok(None)
            }
            Err(err) => {
                self.kill_decoder();
                Err(SourceError::Other(err.into()))
            }
        }
    }

    fn seek(&mut self, index: u64) -> Result<(), SourceError> {
        if index == self.next_index && self.stdout.is_some() {
            return Ok(());
        }
        self.kill_decoder();
        self.next_index = index;
        Ok(())
    }

    fn total_frames(&self) -> u64 {
        self.info.total_frames
    }

    fn dimensions(&self) -> (i32, i32) {
        (self.info.width, self.info.height)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.kill_decoder();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probe_json() {
        let json = r#"{
            "streams": [{
                "width": 640,
                "height": 480,
                "r_frame_rate": "25/1",
                "nb_frames": "250",
                "duration": "10.000000"
            }]
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.width, 640);
        assert_eq!(info.height, 480);
        assert_eq!(info.total_frames, 250);
        assert!((info.fps - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn falls_back_to_duration_when_nb_frames_missing() {
        let json = r#"{
            "streams": [{
                "width": 1280,
                "height": 720,
                "r_frame_rate": "30000/1001",
                "duration": "2.002000"
            }]
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.total_frames, 60);
    }

    #[test]
    fn rejects_probe_without_stream() {
        let err = parse_probe_output(r#"{"streams": []}"#).unwrap_err();
        assert!(err.to_string().contains("no video stream"));
    }

    #[test]
    fn parses_fractional_and_plain_rates() {
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert!((parse_rate("24").unwrap() - 24.0).abs() < f64::EPSILON);
        assert!(parse_rate("24/0").is_err());
    }

    #[test]
    fn open_rejects_missing_file() {
        match FfmpegSource::open(std::path::Path::new("/nonexistent/clip.mp4")) {
            Err(SourceError::Open { path }) => {
                assert_eq!(path, std::path::Path::new("/nonexistent/clip.mp4"));
            }
            Err(other) => panic!("expected open error, got {other}"),
            Ok(_) => panic!("open succeeded for a missing file"),
        }
    }
}
