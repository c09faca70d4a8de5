//! Configuration parsing for the streaming service.
//!
//! CLI flags fall back to the environment variables the service has always
//! been deployed with (`CAMERA_ID`, `ENABLE_YOLO`, `SERVER_PORT`, ...). The
//! result is validated once into an immutable [`StreamConfig`].

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, ValueEnum, builder::FalseyValueParser};
use serde::Serialize;

use crate::{pipeline::PipelineOptions, rate::frame_interval};

/// Inference device preference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Acceleration {
    /// CUDA when available, otherwise CPU.
    #[default]
    Auto,
    Cpu,
    /// Require a CUDA device.
    #[value(alias = "gpu", alias = "0")]
    Cuda,
}

#[derive(Clone, Debug, PartialEq)]
/// Where frames come from.
pub enum SourceSelection {
    /// Live camera by index (`0`) or device path (`/dev/video0`).
    Camera { device: String },
    /// Prerecorded clip played in a loop: a directory of images or a video file.
    Clip { path: PathBuf, fps: f32 },
}

#[derive(Clone, Debug)]
pub struct DetectionSettings {
    pub enabled: bool,
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    pub acceleration: Acceleration,
    /// Tag detections with their coarse position in the frame.
    pub location_tags: bool,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
/// Canonical configuration handed to composition. Never reloaded.
pub struct StreamConfig {
    pub source: SourceSelection,
    pub width: u32,
    pub height: u32,
    pub detection: DetectionSettings,
    pub host: String,
    pub port: u16,
    /// JPEG quality used by the encoder (1-100).
    pub jpeg_quality: u8,
    /// Upper bound on frame requests per second.
    pub target_fps: Option<f32>,
    /// Draw the `FRAME n  FPS x` footer on published frames.
    pub overlay: bool,
    /// Restarts allowed after the pipeline errors out.
    pub max_restarts: u32,
    pub verbose: bool,
    pub telemetry: TelemetryOptions,
}

/// CLI arguments accepted by the `serve` and `probe` subcommands.
#[derive(Debug, Clone, Args)]
pub struct StreamCliArgs {
    /// Camera index or device path.
    #[arg(long = "camera", env = "CAMERA_ID", default_value = "0", value_name = "ID")]
    pub camera: String,
    /// Play a looping clip (image directory or video file) instead of the camera.
    #[arg(long = "clip", env = "VIDEO_PATH", value_name = "PATH")]
    pub clip: Option<PathBuf>,
    /// Playback rate of the looping clip.
    #[arg(long = "clip-fps", default_value_t = 30.0, value_name = "FPS")]
    pub clip_fps: f32,
    /// Capture width in pixels.
    #[arg(long = "width", env = "CAMERA_WIDTH", default_value_t = 640, value_name = "PX")]
    pub width: u32,
    /// Capture height in pixels.
    #[arg(long = "height", env = "CAMERA_HEIGHT", default_value_t = 480, value_name = "PX")]
    pub height: u32,

    /// Run the person detector on every frame. `ENABLE_YOLO` accepts any
    /// casing; `false`, `no`, `off`, `0` and empty disable it.
    #[arg(
        long = "detect",
        env = "ENABLE_YOLO",
        action = clap::ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    pub detect: bool,
    /// TorchScript model path.
    #[arg(
        long = "model",
        env = "YOLO_MODEL_PATH",
        default_value = "yolov8n.torchscript",
        value_name = "PATH"
    )]
    pub model: PathBuf,
    /// Minimum confidence for reported detections (0-1).
    #[arg(
        long = "confidence",
        env = "CONFIDENCE_THRESHOLD",
        default_value_t = 0.5,
        value_name = "SCORE"
    )]
    pub confidence: f32,
    /// Inference device.
    #[arg(long = "accel", env = "DEVICE", value_enum, default_value_t = Acceleration::Auto)]
    pub acceleration: Acceleration,
    /// Tag detections with Left/Center/Right and Far/Mid/Near.
    #[arg(long = "location-tags", action = clap::ArgAction::SetTrue)]
    pub location_tags: bool,

    /// Address the HTTP server binds to.
    #[arg(long = "host", env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Port the HTTP server binds to.
    #[arg(long = "port", env = "SERVER_PORT", default_value_t = 8080)]
    pub port: u16,

    /// JPEG quality used by the encoder (1-100).
    #[arg(
        long = "jpeg-quality",
        env = "JPEG_QUALITY",
        default_value_t = 70,
        value_name = "QUALITY"
    )]
    pub jpeg_quality: u8,
    /// Cap on frames requested per second.
    #[arg(long = "target-fps", env = "TARGET_FPS", value_name = "FPS")]
    pub target_fps: Option<f32>,
    /// Draw a frame number and FPS footer on every published frame.
    #[arg(long = "overlay", action = clap::ArgAction::SetTrue)]
    pub overlay: bool,

    /// Restart an errored pipeline up to N times.
    #[arg(long = "max-restarts", default_value_t = 0, value_name = "N")]
    pub max_restarts: u32,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Enable verbose logging (per-frame detections).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<StreamCliArgs> for StreamConfig {
    type Error = anyhow::Error;

    fn try_from(args: StreamCliArgs) -> Result<Self> {
        if args.width == 0 || args.height == 0 {
            bail!("Capture width and height must be positive integers");
        }
        if !(0.0..=1.0).contains(&args.confidence) {
            bail!("--confidence must be between 0 and 1");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if let Some(fps) = args.target_fps {
            if frame_interval(fps).is_none() {
                bail!("--target-fps must be a positive number with a representable frame period");
            }
        }

        let source = match args.clip {
            Some(path) => {
                if frame_interval(args.clip_fps).is_none() {
                    bail!("--clip-fps must be a positive number with a representable frame period");
                }
                SourceSelection::Clip {
                    path,
                    fps: args.clip_fps,
                }
            }
            None => {
                if args.camera.trim().is_empty() {
                    bail!("--camera must not be empty");
                }
                SourceSelection::Camera {
                    device: args.camera,
                }
            }
        };

        Ok(Self {
            source,
            width: args.width,
            height: args.height,
            detection: DetectionSettings {
                enabled: args.detect,
                model_path: args.model,
                confidence_threshold: args.confidence,
                acceleration: args.acceleration,
                location_tags: args.location_tags,
            },
            host: args.host,
            port: args.port,
            jpeg_quality: args.jpeg_quality,
            target_fps: args.target_fps,
            overlay: args.overlay,
            max_restarts: args.max_restarts,
            verbose: args.verbose,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

impl StreamConfig {
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            jpeg_quality: self.jpeg_quality,
            target_fps: self.target_fps,
            overlay: self.overlay,
            verbose: self.verbose,
            ..PipelineOptions::default()
        }
    }

    /// Read-only projection served by `GET /settings`.
    pub fn settings(&self) -> SettingsSnapshot {
        let (source, device_id) = match &self.source {
            SourceSelection::Camera { device } => ("camera", device.clone()),
            SourceSelection::Clip { path, .. } => ("clip", path.display().to_string()),
        };
        SettingsSnapshot {
            source,
            device_id,
            width: self.width,
            height: self.height,
            detection_enabled: self.detection.enabled,
            confidence_threshold: self.detection.confidence_threshold,
            acceleration: self.detection.acceleration,
            location_tags: self.detection.location_tags,
            jpeg_quality: self.jpeg_quality,
            target_fps: self.target_fps,
            overlay: self.overlay,
            host: self.host.clone(),
            port: self.port,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SettingsSnapshot {
    pub source: &'static str,
    pub device_id: String,
    pub width: u32,
    pub height: u32,
    pub detection_enabled: bool,
    pub confidence_threshold: f32,
    pub acceleration: Acceleration,
    pub location_tags: bool,
    pub jpeg_quality: u8,
    pub target_fps: Option<f32>,
    pub overlay: bool,
    pub host: String,
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        args: StreamCliArgs,
    }

    fn parse(argv: &[&str]) -> Result<StreamConfig> {
        let cli = Cli::try_parse_from(std::iter::once("stream").chain(argv.iter().copied()))?;
        StreamConfig::try_from(cli.args)
    }

    #[test]
    fn explicit_flags_build_camera_config() {
        let config = parse(&[
            "--camera",
            "/dev/video2",
            "--width",
            "320",
            "--height",
            "240",
            "--detect",
            "--confidence",
            "0.7",
            "--accel",
            "cpu",
            "--jpeg-quality",
            "90",
            "--port",
            "9000",
        ])
        .unwrap();

        assert_eq!(
            config.source,
            SourceSelection::Camera {
                device: "/dev/video2".into()
            }
        );
        assert_eq!((config.width, config.height), (320, 240));
        assert!(config.detection.enabled);
        assert_eq!(config.detection.acceleration, Acceleration::Cpu);
        assert_eq!(config.jpeg_quality, 90);
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn gpu_aliases_select_cuda() {
        for alias in ["gpu", "0", "cuda"] {
            let config = parse(&["--accel", alias]).unwrap();
            assert_eq!(config.detection.acceleration, Acceleration::Cuda);
        }
    }

    #[test]
    fn clip_overrides_camera() {
        let config = parse(&["--clip", "demo/frames", "--clip-fps", "12"]).unwrap();
        assert_eq!(
            config.source,
            SourceSelection::Clip {
                path: PathBuf::from("demo/frames"),
                fps: 12.0
            }
        );
        assert_eq!(config.settings().source, "clip");
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parse(&["--jpeg-quality", "0"]).is_err());
        assert!(parse(&["--confidence", "1.5"]).is_err());
        assert!(parse(&["--target-fps", "0"]).is_err());
        assert!(parse(&["--width", "0"]).is_err());
        assert!(parse(&["--clip", "x", "--clip-fps", "-1"]).is_err());
    }

    #[test]
    fn rejects_rates_whose_period_overflows() {
        assert!(parse(&["--target-fps", "1e-30"]).is_err());
        assert!(parse(&["--clip", "x", "--clip-fps", "1e-30"]).is_err());
        assert!(parse(&["--target-fps", "0.5"]).is_ok());
    }

    #[test]
    fn enable_yolo_env_is_case_insensitive() {
        // SAFETY: no other test sets ENABLE_YOLO or asserts on the detection flag
        // without passing --detect.
        unsafe { std::env::set_var("ENABLE_YOLO", "True") };
        let enabled = parse(&[]).map(|config| config.detection.enabled);
        unsafe { std::env::set_var("ENABLE_YOLO", "false") };
        let disabled = parse(&[]).map(|config| config.detection.enabled);
        unsafe { std::env::remove_var("ENABLE_YOLO") };

        assert!(enabled.unwrap());
        assert!(!disabled.unwrap());
    }

    #[test]
    fn settings_snapshot_serializes_active_values() {
        let config = parse(&["--camera", "1", "--target-fps", "15", "--overlay"]).unwrap();
        let json = serde_json::to_value(config.settings()).unwrap();
        assert_eq!(json["device_id"], "1");
        assert_eq!(json["target_fps"], 15.0);
        assert_eq!(json["overlay"], true);
        assert_eq!(json["acceleration"], "auto");

        let options = config.pipeline_options();
        assert_eq!(options.target_fps, Some(15.0));
        assert!(options.overlay);
    }
}
