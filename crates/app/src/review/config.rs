use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};

const SERVE_USAGE: &str = "Usage: review-server serve [--bind <host>] [--port <n>] \
[--uploads-dir <path>] [--feedback-dir <path>] [--footage-dir <path>] \
[--model <path>] [--confidence <0-1>] [--jpeg-quality <1-100>] \
[--canvas-margin <px>] [--class <name=id>]... [--default-class <id>]";

/// Runtime configuration for the review server.
///
/// The canvas margin and correction vocabulary parameterize the UI-space
/// coordinate adjustment in the feedback encoder; both are layout-specific
/// values that must match the front end drawing the boxes.
#[derive(Clone, Debug)]
pub struct ReviewConfig {
    pub host: String,
    pub port: u16,
    pub uploads_dir: PathBuf,
    pub feedback_dir: PathBuf,
    pub footage_dir: PathBuf,
    pub model_path: Option<PathBuf>,
    pub confidence: f32,
    pub jpeg_quality: u8,
    pub canvas_margin: f64,
    pub class_map: Vec<(String, i64)>,
    pub default_class: i64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            uploads_dir: PathBuf::from("uploads"),
            feedback_dir: PathBuf::from("feedback"),
            footage_dir: PathBuf::from("pictures"),
            model_path: None,
            confidence: 0.25,
            jpeg_quality: 85,
            canvas_margin: 50.0,
            class_map: vec![("Adenomatous".to_string(), 2)],
            default_class: 0,
        }
    }
}

impl ReviewConfig {
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();
        let mut class_overrides: Vec<(String, i64)> = Vec::new();

        let mut idx = 2;
        while idx < args.len() {
            match args[idx].as_str() {
                "--bind" => {
                    idx += 1;
                    config.host = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--bind requires a value"))?
                        .clone();
                    idx += 1;
                }
                "--port" => {
                    idx += 1;
                    config.port = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--port requires a value"))?
                        .parse::<u16>()
                        .with_context(|| "--port must be an integer".to_string())?;
                    idx += 1;
                }
                "--uploads-dir" => {
                    idx += 1;
                    config.uploads_dir = PathBuf::from(
                        args.get(idx)
                            .ok_or_else(|| anyhow!("--uploads-dir requires a value"))?,
                    );
                    idx += 1;
                }
                "--feedback-dir" => {
                    idx += 1;
                    config.feedback_dir = PathBuf::from(
                        args.get(idx)
                            .ok_or_else(|| anyhow!("--feedback-dir requires a value"))?,
                    );
                    idx += 1;
                }
                "--footage-dir" => {
                    idx += 1;
                    config.footage_dir = PathBuf::from(
                        args.get(idx)
                            .ok_or_else(|| anyhow!("--footage-dir requires a value"))?,
                    );
                    idx += 1;
                }
                "--model" => {
                    idx += 1;
                    config.model_path = Some(PathBuf::from(
                        args.get(idx)
                            .ok_or_else(|| anyhow!("--model requires a value"))?,
                    ));
                    idx += 1;
                }
                "--confidence" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--confidence requires a value"))?
                        .parse::<f32>()
                        .with_context(|| "--confidence must be a number".to_string())?;
                    if !(0.0..=1.0).contains(&value) {
                        bail!("--confidence must be between 0 and 1");
                    }
                    config.confidence = value;
                    idx += 1;
                }
                "--jpeg-quality" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--jpeg-quality requires a value"))?
                        .parse::<u8>()
                        .with_context(|| {
                            "--jpeg-quality must be an integer between 1 and 100".to_string()
                        })?;
                    if !(1..=100).contains(&value) {
                        bail!("--jpeg-quality must be an integer between 1 and 100");
                    }
                    config.jpeg_quality = value;
                    idx += 1;
                }
                "--canvas-margin" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--canvas-margin requires a value"))?
                        .parse::<f64>()
                        .with_context(|| "--canvas-margin must be a number".to_string())?;
                    if value < 0.0 {
                        bail!("--canvas-margin must not be negative");
                    }
                    config.canvas_margin = value;
                    idx += 1;
                }
                "--class" => {
                    idx += 1;
                    let spec = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--class requires a value of the form name=id"))?;
                    let (name, id) = spec
                        .split_once('=')
                        .ok_or_else(|| anyhow!("--class expects name=id, got {spec:?}"))?;
                    let id = id
                        .parse::<i64>()
                        .with_context(|| format!("bad class id in {spec:?}"))?;
                    class_overrides.push((name.to_string(), id));
                    idx += 1;
                }
                "--default-class" => {
                    idx += 1;
                    config.default_class = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--default-class requires a value"))?
                        .parse::<i64>()
                        .with_context(|| "--default-class must be an integer".to_string())?;
                    idx += 1;
                }
                arg => {
                    bail!("Unrecognised argument: {arg}\n{SERVE_USAGE}");
                }
            }
        }

        if !class_overrides.is_empty() {
            config.class_map = class_overrides;
        }

        Ok(config)
    }

    /// Map a client-supplied correction label onto a numeric class id.
    pub fn class_for(&self, label: &str) -> i64 {
        self.class_map
            .iter()
            .find(|(name, _)| name == label)
            .map(|(_, id)| *id)
            .unwrap_or(self.default_class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(rest: &[&str]) -> Vec<String> {
        let mut all = vec!["review-server".to_string(), "serve".to_string()];
        all.extend(rest.iter().map(|s| s.to_string()));
        all
    }

    #[test]
    fn defaults_are_applied() {
        let config = ReviewConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.canvas_margin, 50.0);
        assert_eq!(config.class_for("Adenomatous"), 2);
        assert_eq!(config.class_for("Hyperplastic"), 0);
    }

    #[test]
    fn parses_overrides() {
        let config = ReviewConfig::from_args(&args(&[
            "--bind",
            "0.0.0.0",
            "--port",
            "9000",
            "--jpeg-quality",
            "70",
            "--canvas-margin",
            "12.5",
            "--class",
            "Sessile=3",
            "--class",
            "Pedunculated=4",
            "--default-class",
            "1",
        ]))
        .unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.jpeg_quality, 70);
        assert_eq!(config.canvas_margin, 12.5);
        assert_eq!(config.class_for("Sessile"), 3);
        assert_eq!(config.class_for("Pedunculated"), 4);
        assert_eq!(config.class_for("anything else"), 1);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(ReviewConfig::from_args(&args(&["--jpeg-quality", "0"])).is_err());
        assert!(ReviewConfig::from_args(&args(&["--confidence", "1.5"])).is_err());
        assert!(ReviewConfig::from_args(&args(&["--class", "nameonly"])).is_err());
        assert!(ReviewConfig::from_args(&args(&["--mystery"])).is_err());
    }
}
