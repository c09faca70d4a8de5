//! Wiring: concrete source and detector from configuration, the HTTP server,
//! and the supervisor that restarts a failed pipeline.

use std::{sync::OnceLock, time::Duration};

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, Sender, select};
use ml_core::{Detector, LocationTagger, NullDetector};
use tracing::{error, info, warn};
use video_ingest::{FrameSource, LoopingSource, Reel};
use vision::{
    FramePublisher, Pipeline, PipelineError, SourceSelection, StreamConfig, feed,
    spawn_stream_server, telemetry,
};

const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Frame source described by the configuration.
pub fn build_source(config: &StreamConfig) -> Result<Box<dyn FrameSource>> {
    match &config.source {
        SourceSelection::Camera { device } => camera_source(config, device),
        SourceSelection::Clip { path, fps } if path.is_dir() => Ok(Box::new(
            LoopingSource::new(Reel::ImageDir(path.clone()))
                .with_target_size(config.width, config.height)
                .with_frame_rate(*fps),
        )),
        SourceSelection::Clip { path, fps } => video_clip_source(config, path, *fps),
    }
}

#[cfg(feature = "opencv")]
fn camera_source(config: &StreamConfig, device: &str) -> Result<Box<dyn FrameSource>> {
    let fps = config.target_fps.unwrap_or(30.0) as f64;
    Ok(Box::new(
        video_ingest::CameraSource::new(device, config.width, config.height)
            .with_requested_fps(fps),
    ))
}

#[cfg(not(feature = "opencv"))]
fn camera_source(_config: &StreamConfig, device: &str) -> Result<Box<dyn FrameSource>> {
    bail!(
        "camera {device} needs a build with the `opencv` feature; use --clip <DIR> to play a looping clip"
    )
}

#[cfg(feature = "opencv")]
fn video_clip_source(
    config: &StreamConfig,
    path: &std::path::Path,
    fps: f32,
) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(
        LoopingSource::new(Reel::VideoFile(path.to_path_buf()))
            .with_target_size(config.width, config.height)
            .with_frame_rate(fps),
    ))
}

#[cfg(not(feature = "opencv"))]
fn video_clip_source(
    _config: &StreamConfig,
    path: &std::path::Path,
    _fps: f32,
) -> Result<Box<dyn FrameSource>> {
    bail!(
        "{} is not a directory of images; video files need a build with the `opencv` feature",
        path.display()
    )
}

/// Detector described by the configuration: the null detector unless
/// detection is enabled, optionally wrapped with location tags.
pub fn build_detector(config: &StreamConfig) -> Result<Box<dyn Detector>> {
    let detector: Box<dyn Detector> = if config.detection.enabled {
        model_detector(config)?
    } else {
        Box::new(NullDetector)
    };
    if config.detection.location_tags {
        Ok(Box::new(LocationTagger::new(detector)))
    } else {
        Ok(detector)
    }
}

#[cfg(feature = "with-tch")]
fn model_detector(config: &StreamConfig) -> Result<Box<dyn Detector>> {
    use ml_core::{TorchDetector, tch::Device, torch::select_device};
    use vision::Acceleration;

    let settings = &config.detection;
    let device = match settings.acceleration {
        Acceleration::Cpu => Device::Cpu,
        Acceleration::Auto => select_device(false, config.verbose),
        Acceleration::Cuda => {
            let device = select_device(false, config.verbose);
            if device == Device::Cpu {
                bail!("--accel cuda requested but libtorch sees no CUDA device");
            }
            device
        }
    };
    info!(
        model = %settings.model_path.display(),
        device = ?device,
        "using TorchScript detector"
    );
    Ok(Box::new(TorchDetector::new(
        &settings.model_path,
        device,
        settings.confidence_threshold,
    )))
}

#[cfg(not(feature = "with-tch"))]
fn model_detector(_config: &StreamConfig) -> Result<Box<dyn Detector>> {
    bail!("detection was requested but this build lacks the `with-tch` feature")
}

/// Receiver raised on Ctrl+C. The handler is installed once per process and
/// the channel lives as long as the process, so a receiver only ever yields
/// on a real signal even when installation failed.
fn install_shutdown_handler() -> Receiver<()> {
    static SHUTDOWN: OnceLock<(Sender<()>, Receiver<()>)> = OnceLock::new();

    let (_, rx) = SHUTDOWN.get_or_init(|| {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handler_tx = tx.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            let _ = handler_tx.try_send(());
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
        (tx, rx)
    });
    rx.clone()
}

/// Run the pipeline and HTTP server until Ctrl+C or an unrecoverable failure.
pub fn serve(config: StreamConfig) -> Result<()> {
    let _telemetry_guard = telemetry::init_process(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();
    let shutdown = install_shutdown_handler();

    let (publisher, feed) = feed::channel();
    let server = spawn_stream_server(feed, config.settings(), &config.host, config.port)?;
    let result = supervise(&config, &publisher, &shutdown);
    server.stop();
    result
}

/// Keep a pipeline running, restarting it after source failures up to
/// `max_restarts` times. Each restart is a fresh run with its own epoch.
fn supervise(
    config: &StreamConfig,
    publisher: &FramePublisher,
    shutdown: &Receiver<()>,
) -> Result<()> {
    let mut restarts: u32 = 0;
    let mut ran_once = false;

    loop {
        let pipeline = Pipeline::new(
            build_source(config)?,
            build_detector(config)?,
            publisher.clone(),
            config.pipeline_options(),
        );

        let failure = match vision::spawn(pipeline) {
            Ok(handle) => {
                ran_once = true;
                let done = handle.done().clone();
                select! {
                    recv(shutdown) -> _ => {
                        info!("shutdown requested; stopping pipeline");
                        handle.stop();
                        let exit = handle.join()?;
                        return exit.result.context("pipeline failed while stopping");
                    }
                    recv(done) -> _ => {}
                }
                match handle.join()?.result {
                    Ok(()) => return Ok(()),
                    Err(err) => err,
                }
            }
            Err(err @ PipelineError::Init(_)) if !ran_once => {
                return Err(err).context("pipeline could not start");
            }
            Err(err) => err,
        };

        if restarts >= config.max_restarts {
            return Err(failure).context(format!("pipeline failed after {restarts} restart(s)"));
        }
        restarts += 1;
        error!("pipeline failed: {failure}");
        warn!(
            "restarting pipeline in {:?} (attempt {restarts}/{})",
            RESTART_DELAY, config.max_restarts
        );
        select! {
            recv(shutdown) -> _ => return Ok(()),
            default(RESTART_DELAY) => {}
        }
    }
}

/// Smoke-test the configured source and detector without serving anything.
pub fn probe(config: StreamConfig) -> Result<()> {
    let _telemetry_guard = telemetry::init_process(&config.telemetry);

    let mut source = build_source(&config)?;
    source
        .open()
        .with_context(|| format!("failed to open {}", source.describe()))?;
    let frame = source.read_frame();
    source.close();
    let frame = frame.context("failed to read a frame")?;

    let mut detector = build_detector(&config)?;
    detector.initialize()?;
    let detections = detector.detect(&frame);
    detector.release();
    let detections = detections.context("detection failed")?;

    info!(
        source = %source.describe(),
        detector = %detector.name(),
        width = frame.width,
        height = frame.height,
        detections = detections.len(),
        "probe succeeded"
    );
    println!(
        "{}: {}x{} frame, {} detection(s)",
        source.describe(),
        frame.width,
        frame.height,
        detections.len()
    );
    for det in &detections {
        println!(
            "  {} {:.2} {:?} {}",
            det.label,
            det.confidence,
            det.bbox,
            det.location.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use clap::Parser;
    use vision::StreamCliArgs;

    use super::*;

    #[derive(Parser)]
    struct Args {
        #[command(flatten)]
        args: StreamCliArgs,
    }

    fn config(argv: &[&str]) -> StreamConfig {
        let argv = std::iter::once("test").chain(argv.iter().copied());
        let parsed = Args::try_parse_from(argv).unwrap();
        StreamConfig::try_from(parsed.args).unwrap()
    }

    fn write_clip(dir: &Path, frames: u8) {
        for i in 0..frames {
            let img = image::RgbImage::from_pixel(20, 10, image::Rgb([i * 50, 0, 0]));
            img.save(dir.join(format!("frame_{i:02}.png"))).unwrap();
        }
    }

    #[test]
    fn image_directory_becomes_looping_source() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), 2);
        let path = dir.path().to_str().unwrap();
        let config = config(&["--clip", path, "--width", "10", "--height", "5"]);

        let mut source = build_source(&config).unwrap();
        source.open().unwrap();
        let frame = source.read_frame().unwrap();
        assert_eq!((frame.width, frame.height), (10, 5));
        source.close();
    }

    #[test]
    fn detection_disabled_uses_null_detector() {
        let detector = build_detector(&config(&[])).unwrap();
        assert_eq!(detector.name(), "null");

        let tagged = build_detector(&config(&["--location-tags"])).unwrap();
        assert_eq!(tagged.name(), "null+location");
    }

    #[cfg(not(feature = "with-tch"))]
    #[test]
    fn detection_without_model_runtime_is_rejected() {
        assert!(build_detector(&config(&["--detect"])).is_err());
    }

    #[cfg(not(feature = "opencv"))]
    #[test]
    fn camera_without_opencv_is_rejected() {
        let err = build_source(&config(&["--camera", "0"]))
            .err()
            .unwrap()
            .to_string();
        assert!(err.contains("opencv"));
    }

    #[test]
    fn probe_reads_one_frame_from_clip() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), 1);
        let path = dir.path().to_str().unwrap();
        probe(config(&["--clip", path])).unwrap();
    }

    #[test]
    fn shutdown_receiver_stays_quiet_without_a_signal() {
        let first = install_shutdown_handler();
        let second = install_shutdown_handler();
        for rx in [first, second] {
            assert_eq!(
                rx.recv_timeout(Duration::from_millis(50)),
                Err(crossbeam_channel::RecvTimeoutError::Timeout)
            );
        }
    }

    #[test]
    fn init_failure_on_first_run_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let config = config(&["--clip", path, "--max-restarts", "3"]);
        let (publisher, _feed) = feed::channel();
        let (_tx, shutdown) = crossbeam_channel::bounded(1);

        let err = supervise(&config, &publisher, &shutdown).unwrap_err();
        assert!(format!("{err:#}").contains("could not start"));
    }
}
