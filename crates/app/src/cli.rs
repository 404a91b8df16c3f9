use anyhow::Result;

use crate::review;

pub const USAGE: &str = "\
Usage: review-server <command> [options]

Commands:
  serve    Start the review HTTP server

Options for serve:
  --bind <host>            Address to bind (default 127.0.0.1)
  --port <port>            Port to bind (default 8000)
  --uploads-dir <path>     Directory for uploaded videos (default uploads)
  --feedback-dir <path>    Directory for feedback images/labels (default feedback)
  --footage-dir <path>     Directory for saved footage stills (default pictures)
  --model <path>           TorchScript model to load (requires with-tch build)
  --confidence <0..1>      Detection confidence threshold (default 0.25)
  --jpeg-quality <1..100>  Stream JPEG quality (default 85)
  --canvas-margin <px>     Browser canvas left margin (default 50)
  --class <name=id>        Add a diagnosis label to class id mapping
  --default-class <id>     Class id for unmapped labels (default 0)
";

pub fn handle_commands(args: &[String]) -> Result<bool> {
    match args.get(1).map(|s| s.as_str()) {
        Some("serve") => {
            let config = review::ReviewConfig::from_args(args)?;
            review::run(config)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
