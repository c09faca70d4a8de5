//! Acquisition loop: read a frame, run the detector, publish the result.
//!
//! A [`Pipeline`] exclusively owns one frame source and one detector and is
//! driven from a single thread (see [`spawn`]). Every cycle publishes a fresh
//! [`PublishedState`] through the [`FramePublisher`]; nothing downstream can
//! slow the loop down.
//!
//! States: `Created -> Initialized -> Running -> Stopped`, with `Errored`
//! entered when the source fails.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use actix_web::web::Bytes;
use chrono::Utc;
use crossbeam_channel::Receiver;
use ml_core::{Detector, DetectorInitError, annotation::draw_footer};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use video_ingest::{FrameSource, SourceError};

use crate::{
    data::{PipelineStatus, PublishedState},
    encoding::encode_jpeg,
    feed::{FrameFeed, FramePublisher},
    rate::{FPS_WINDOW, FrameRateMeter, frame_interval},
    telemetry,
};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// JPEG quality used for published frames (1-100).
    pub jpeg_quality: u8,
    /// Upper bound on frame requests per second. `None` runs as fast as the
    /// source delivers.
    pub target_fps: Option<f32>,
    /// Draw the `FRAME n  FPS x` footer.
    pub overlay: bool,
    /// Publications averaged by the frame-rate estimate.
    pub fps_window: usize,
    /// Log every cycle's detections.
    pub verbose: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: 70,
            target_fps: None,
            overlay: false,
            fps_window: FPS_WINDOW,
            verbose: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("frame source: {0}")]
    Source(#[source] SourceError),
    #[error(transparent)]
    Detector(#[from] DetectorInitError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline initialisation failed: {0}")]
    Init(#[from] InitError),
    #[error("frame source failed: {0}")]
    Source(#[source] SourceError),
    #[error("cannot {action} a pipeline that is {state}")]
    InvalidState {
        action: &'static str,
        state: PipelineStatus,
    },
    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("pipeline thread panicked")]
    Panicked,
    #[error("pipeline initialization already failed; build a new pipeline")]
    InitFailed,
}

pub struct Pipeline {
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    publisher: FramePublisher,
    options: PipelineOptions,
    state: PipelineStatus,
    epoch: u64,
    sequence: u64,
    rate: FrameRateMeter,
    min_interval: Option<Duration>,
    last_request: Option<Instant>,
    last_publish: Option<Instant>,
    init_failed: bool,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        publisher: FramePublisher,
        options: PipelineOptions,
    ) -> Self {
        let min_interval = options.target_fps.and_then(frame_interval);
        Self {
            source,
            detector,
            publisher,
            rate: FrameRateMeter::new(options.fps_window),
            options,
            state: PipelineStatus::Created,
            epoch: 0,
            sequence: 0,
            min_interval,
            last_request: None,
            last_publish: None,
            init_failed: false,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.state
    }

    /// Sequence of the last publication in the current run.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn feed(&self) -> FrameFeed {
        self.publisher.feed()
    }

    /// Open the source, then initialize the detector.
    ///
    /// On failure whatever already succeeded is released, the pipeline stays
    /// `Created`, and the feed reports the run as errored. A pipeline gets one
    /// attempt; later calls fail with [`PipelineError::InitFailed`].
    pub fn initialize(&mut self) -> Result<(), PipelineError> {
        if self.init_failed {
            return Err(PipelineError::InitFailed);
        }
        if self.state != PipelineStatus::Created {
            return Err(PipelineError::InvalidState {
                action: "initialize",
                state: self.state,
            });
        }

        if let Err(err) = self.source.open() {
            error!(source = %self.source.describe(), "failed to open frame source: {err}");
            self.init_failed = true;
            self.publisher.fail(err.to_string());
            return Err(InitError::Source(err).into());
        }
        if let Err(err) = self.detector.initialize() {
            error!(detector = %self.detector.name(), "{err}");
            self.source.close();
            self.init_failed = true;
            self.publisher.fail(err.to_string());
            return Err(InitError::Detector(err).into());
        }

        self.epoch = self.publisher.begin_run();
        self.state = PipelineStatus::Initialized;
        info!(
            source = %self.source.describe(),
            detector = %self.detector.name(),
            epoch = self.epoch,
            "pipeline initialized"
        );
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineStatus::Initialized {
            return Err(PipelineError::InvalidState {
                action: "start",
                state: self.state,
            });
        }
        self.rate.reset();
        self.sequence = 0;
        self.last_request = None;
        self.last_publish = None;
        self.state = PipelineStatus::Running;
        self.publisher.set_status(PipelineStatus::Running);
        Ok(())
    }

    /// Run one acquisition cycle and publish its result.
    pub fn step(&mut self) -> Result<Arc<PublishedState>, PipelineError> {
        if self.state != PipelineStatus::Running {
            return Err(PipelineError::InvalidState {
                action: "step",
                state: self.state,
            });
        }
        let cycle_span = tracing::info_span!("pipeline.cycle", sequence = self.sequence + 1);
        let _cycle_guard = cycle_span.enter();

        self.pace();

        let read_start = Instant::now();
        let frame = match tracing::info_span!("source.read").in_scope(|| self.source.read_frame()) {
            Ok(frame) => frame,
            Err(err) => {
                error!(source = %self.source.describe(), "frame source failed: {err}");
                self.teardown();
                self.state = PipelineStatus::Errored;
                self.publisher.fail(err.to_string());
                return Err(PipelineError::Source(err));
            }
        };
        metrics::histogram!("stream_stage_latency_seconds", "stage" => "read")
            .record(read_start.elapsed().as_secs_f64());

        let detect_start = Instant::now();
        let detect_span = tracing::info_span!("detector.detect", detector = %self.detector.name());
        let (frame, detections) = match detect_span.in_scope(|| self.detector.detect(&frame)) {
            Ok(detections) => {
                let annotated = self.detector.annotate(frame, &detections);
                (annotated, detections)
            }
            Err(err) => {
                warn!(
                    "detection failed on frame {}: {err}; publishing unannotated",
                    self.sequence + 1
                );
                metrics::counter!("stream_detection_errors_total").increment(1);
                (frame, Vec::new())
            }
        };
        metrics::histogram!("stream_stage_latency_seconds", "stage" => "detect")
            .record(detect_start.elapsed().as_secs_f64());

        let now = Instant::now();
        if let Some(previous) = self.last_publish.replace(now) {
            metrics::histogram!("stream_frame_interval_seconds")
                .record(now.duration_since(previous).as_secs_f64());
        }
        let fps = self.rate.record(now);
        self.sequence += 1;

        let frame = if self.options.overlay {
            draw_footer(frame, &footer_text(self.sequence, fps))
        } else {
            frame
        };

        let encode_start = Instant::now();
        let jpeg = match encode_jpeg(&frame, self.options.jpeg_quality) {
            Ok(buffer) => Some(Bytes::from(buffer)),
            Err(err) => {
                warn!("frame {} not encoded: {err}", self.sequence);
                None
            }
        };
        metrics::histogram!("stream_stage_latency_seconds", "stage" => "encode")
            .record(encode_start.elapsed().as_secs_f64());

        if self.options.verbose {
            if detections.is_empty() {
                debug!("frame #{}: no detections", self.sequence);
            }
            for (idx, det) in detections.iter().enumerate() {
                debug!(
                    "frame #{} det #{idx}: {} conf={:.3} bbox={:?}",
                    self.sequence, det.label, det.confidence, det.bbox
                );
            }
        }
        if self.sequence % 30 == 0 {
            debug!(
                "pipeline heartbeat: frame #{}, {:.1} fps",
                self.sequence,
                fps.unwrap_or(0.0)
            );
        }

        let published = Arc::new(PublishedState {
            sequence: self.sequence,
            epoch: self.epoch,
            timestamp_ms: Utc::now().timestamp_millis(),
            fps,
            frame,
            detections,
            jpeg,
        });
        self.publisher.publish(Arc::clone(&published));

        metrics::counter!("stream_frames_published_total").increment(1);
        if let Some(fps) = fps {
            metrics::gauge!("stream_pipeline_fps").set(fps as f64);
        }
        Ok(published)
    }

    /// Run cycles until `stop` is raised or the source fails. The flag is
    /// checked before each cycle, so an in-flight cycle always publishes.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), PipelineError> {
        if self.state == PipelineStatus::Initialized {
            self.start()?;
        }
        let run_span = tracing::info_span!(
            "pipeline.run",
            source = %self.source.describe(),
            detector = %self.detector.name(),
            epoch = self.epoch
        );
        let _run_guard = run_span.enter();
        info!("pipeline running");

        loop {
            if stop.load(Ordering::Relaxed) {
                self.stop();
                return Ok(());
            }
            self.step()?;
        }
    }

    /// Release detector and source and enter `Stopped`. Idempotent; a pipeline
    /// that already errored keeps its status.
    pub fn stop(&mut self) {
        match self.state {
            PipelineStatus::Initialized | PipelineStatus::Running => {
                self.teardown();
                self.state = PipelineStatus::Stopped;
                self.publisher.set_status(PipelineStatus::Stopped);
                info!(published = self.sequence, "pipeline stopped");
            }
            PipelineStatus::Created => self.state = PipelineStatus::Stopped,
            PipelineStatus::Stopped | PipelineStatus::Errored => {}
        }
    }

    /// Give back the source and detector, e.g. to inspect them after a run.
    pub fn into_parts(self) -> (Box<dyn FrameSource>, Box<dyn Detector>) {
        (self.source, self.detector)
    }

    fn teardown(&mut self) {
        self.detector.release();
        self.source.close();
    }

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.min_interval, self.last_request) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        self.last_request = Some(Instant::now());
    }
}

fn footer_text(sequence: u64, fps: Option<f32>) -> String {
    format!("FRAME {sequence:06}  FPS {:4.1}", fps.unwrap_or(0.0))
}

/// What a pipeline thread hands back when it exits.
pub struct PipelineExit {
    pub pipeline: Pipeline,
    pub result: Result<(), PipelineError>,
}

/// Owner's handle on a pipeline running on its own thread.
pub struct PipelineHandle {
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    thread: Option<thread::JoinHandle<PipelineExit>>,
}

impl PipelineHandle {
    /// Request a cooperative stop after the in-flight cycle.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Disconnects when the pipeline thread exits; usable in `select!`.
    pub fn done(&self) -> &Receiver<()> {
        &self.done
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Wait for the thread to exit and take the pipeline back.
    pub fn join(mut self) -> Result<PipelineExit, PipelineError> {
        let thread = self.thread.take().ok_or(PipelineError::Panicked)?;
        thread.join().map_err(|_| PipelineError::Panicked)
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop.store(true, Ordering::SeqCst);
            let _ = thread.join();
        }
    }
}

/// Initialize `pipeline` on a dedicated thread and start its loop there.
///
/// Returns once initialization finished, so startup failures surface to the
/// caller instead of a detached thread.
pub fn spawn(pipeline: Pipeline) -> Result<PipelineHandle, PipelineError> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let (init_tx, init_rx) = crossbeam_channel::bounded::<Result<(), PipelineError>>(1);
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

    let thread = telemetry::spawn_thread("stream-pipeline", move || {
        let _done = done_tx;
        let mut pipeline = pipeline;
        if let Err(err) = pipeline.initialize() {
            let _ = init_tx.send(Err(err));
            return PipelineExit {
                pipeline,
                result: Ok(()),
            };
        }
        if init_tx.send(Ok(())).is_err() {
            pipeline.stop();
            return PipelineExit {
                pipeline,
                result: Ok(()),
            };
        }
        drop(init_tx);
        let result = pipeline.run(&thread_stop);
        PipelineExit { pipeline, result }
    })
    .map_err(PipelineError::Spawn)?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(PipelineHandle {
            stop,
            done: done_rx,
            thread: Some(thread),
        }),
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        }
        Err(_) => {
            let _ = thread.join();
            Err(PipelineError::Panicked)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use ml_core::{BoundingBox, Detection, DetectionError, NullDetector};
    use video_ingest::{Frame, LoopingSource, Reel};

    use super::*;
    use crate::feed;

    fn reel(n: u8) -> Box<dyn FrameSource> {
        let frames = (0..n).map(|i| Frame::solid(8, 8, [i * 10, 0, 0])).collect();
        Box::new(LoopingSource::new(Reel::Frames(frames)))
    }

    struct FailingSource;

    impl FrameSource for FailingSource {
        fn describe(&self) -> &str {
            "missing"
        }

        fn open(&mut self) -> Result<(), SourceError> {
            Err(SourceError::Unavailable {
                uri: "missing".into(),
                reason: "no such device".into(),
            })
        }

        fn read_frame(&mut self) -> Result<Frame, SourceError> {
            unreachable!("never opened")
        }

        fn close(&mut self) {}

        fn is_open(&self) -> bool {
            false
        }
    }

    struct BrokenDetector;

    impl Detector for BrokenDetector {
        fn name(&self) -> &str {
            "broken"
        }

        fn initialize(&mut self) -> Result<(), DetectorInitError> {
            Err(DetectorInitError::new("broken", "weights missing"))
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
            Err(DetectionError::NotInitialised)
        }

        fn annotate(&mut self, frame: Frame, _detections: &[Detection]) -> Frame {
            frame
        }

        fn release(&mut self) {}
    }

    #[test]
    fn lifecycle_follows_state_machine() {
        let (publisher, feed) = feed::channel();
        let mut pipeline = Pipeline::new(
            reel(2),
            Box::new(NullDetector),
            publisher,
            PipelineOptions::default(),
        );
        assert_eq!(pipeline.status(), PipelineStatus::Created);
        assert!(matches!(
            pipeline.step(),
            Err(PipelineError::InvalidState { action: "step", .. })
        ));

        pipeline.initialize().unwrap();
        assert_eq!(feed.status(), PipelineStatus::Initialized);
        pipeline.start().unwrap();
        assert_eq!(feed.status(), PipelineStatus::Running);

        let first = pipeline.step().unwrap();
        assert_eq!(first.sequence, 1);
        assert!(first.jpeg.is_some());

        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.status(), PipelineStatus::Stopped);
        assert_eq!(feed.status(), PipelineStatus::Stopped);
    }

    #[test]
    fn source_open_failure_is_init_error() {
        let (publisher, feed) = feed::channel();
        let mut pipeline = Pipeline::new(
            Box::new(FailingSource),
            Box::new(NullDetector),
            publisher,
            PipelineOptions::default(),
        );
        let err = pipeline.initialize().unwrap_err();
        assert!(matches!(err, PipelineError::Init(InitError::Source(_))));
        assert_eq!(pipeline.status(), PipelineStatus::Created);
        assert_eq!(feed.status(), PipelineStatus::Errored);
    }

    #[test]
    fn detector_init_failure_closes_opened_source() {
        let (publisher, _feed) = feed::channel();
        let mut pipeline = Pipeline::new(
            reel(1),
            Box::new(BrokenDetector),
            publisher,
            PipelineOptions::default(),
        );
        let err = pipeline.initialize().unwrap_err();
        assert!(matches!(err, PipelineError::Init(InitError::Detector(_))));

        let (source, _) = pipeline.into_parts();
        assert!(!source.is_open());
    }

    #[test]
    fn failed_initialization_is_not_retried_on_the_same_detector() {
        struct CountedBroken(Arc<AtomicUsize>);

        impl Detector for CountedBroken {
            fn name(&self) -> &str {
                "counted"
            }

            fn initialize(&mut self) -> Result<(), DetectorInitError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(DetectorInitError::new("counted", "no device"))
            }

            fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
                Err(DetectionError::NotInitialised)
            }

            fn annotate(&mut self, frame: Frame, _detections: &[Detection]) -> Frame {
                frame
            }

            fn release(&mut self) {}
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let (publisher, _feed) = feed::channel();
        let mut pipeline = Pipeline::new(
            reel(1),
            Box::new(CountedBroken(Arc::clone(&calls))),
            publisher,
            PipelineOptions::default(),
        );
        assert!(matches!(pipeline.initialize(), Err(PipelineError::Init(_))));
        assert!(matches!(pipeline.initialize(), Err(PipelineError::InitFailed)));
        assert!(matches!(pipeline.start(), Err(PipelineError::InvalidState { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.status(), PipelineStatus::Created);
    }

    #[test]
    fn unrepresentable_target_fps_runs_unpaced() {
        let (publisher, _feed) = feed::channel();
        let options = PipelineOptions {
            target_fps: Some(1e-30),
            ..PipelineOptions::default()
        };
        let mut pipeline = Pipeline::new(reel(1), Box::new(NullDetector), publisher, options);
        pipeline.initialize().unwrap();
        pipeline.start().unwrap();
        assert_eq!(pipeline.step().unwrap().sequence, 1);
        assert_eq!(pipeline.step().unwrap().sequence, 2);
    }

    #[test]
    fn overlay_changes_published_pixels() {
        let (publisher, _feed) = feed::channel();
        let options = PipelineOptions {
            overlay: true,
            ..PipelineOptions::default()
        };
        let frames = vec![Frame::solid(160, 40, [30, 30, 30])];
        let mut pipeline = Pipeline::new(
            Box::new(LoopingSource::new(Reel::Frames(frames.clone()))),
            Box::new(NullDetector),
            publisher,
            options,
        );
        pipeline.initialize().unwrap();
        pipeline.start().unwrap();
        let published = pipeline.step().unwrap();
        assert_ne!(published.frame, frames[0]);
    }

    #[test]
    fn target_fps_spaces_frame_requests() {
        let (publisher, _feed) = feed::channel();
        let options = PipelineOptions {
            target_fps: Some(50.0),
            ..PipelineOptions::default()
        };
        let mut pipeline = Pipeline::new(reel(3), Box::new(NullDetector), publisher, options);
        pipeline.initialize().unwrap();
        pipeline.start().unwrap();

        let start = Instant::now();
        for _ in 0..4 {
            pipeline.step().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(55));
    }

    #[test]
    fn footer_text_formats_sequence_and_rate() {
        assert_eq!(footer_text(42, Some(29.84)), "FRAME 000042  FPS 29.8");
        assert_eq!(footer_text(1, None), "FRAME 000001  FPS  0.0");
    }

    #[test]
    fn spawn_reports_init_failure() {
        let (publisher, _feed) = feed::channel();
        let pipeline = Pipeline::new(
            Box::new(FailingSource),
            Box::new(NullDetector),
            publisher,
            PipelineOptions::default(),
        );
        assert!(matches!(
            spawn(pipeline),
            Err(PipelineError::Init(InitError::Source(_)))
        ));
    }

    #[test]
    fn detections_survive_into_published_state() {
        struct OneBox;

        impl Detector for OneBox {
            fn name(&self) -> &str {
                "one-box"
            }

            fn initialize(&mut self) -> Result<(), DetectorInitError> {
                Ok(())
            }

            fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
                Ok(vec![Detection::new(
                    "person",
                    0.9,
                    BoundingBox::new(2.0, 12.0, 20.0, 25.0),
                )])
            }

            fn annotate(&mut self, frame: Frame, detections: &[Detection]) -> Frame {
                ml_core::annotation::draw_detections(frame, detections)
            }

            fn release(&mut self) {}
        }

        let (publisher, _feed) = feed::channel();
        let frames = vec![Frame::solid(32, 32, [0, 0, 0])];
        let mut pipeline = Pipeline::new(
            Box::new(LoopingSource::new(Reel::Frames(frames))),
            Box::new(OneBox),
            publisher,
            PipelineOptions::default(),
        );
        pipeline.initialize().unwrap();
        pipeline.start().unwrap();
        let published = pipeline.step().unwrap();
        assert_eq!(published.detections.len(), 1);
        assert_eq!(
            published.frame.pixel(2, 18),
            Some(&ml_core::annotation::BOX_COLOR[..])
        );
    }
}
