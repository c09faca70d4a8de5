//! Logging, Chrome traces, and the Prometheus recorder behind `/metrics`.

use std::{fs::File, io, path::Path, sync::OnceLock, thread, time::Duration};

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_chrome::{ChromeLayer, ChromeLayerBuilder, FlushGuard, TraceStyle};
use tracing_subscriber::{
    EnvFilter, Registry,
    filter::filter_fn,
    fmt::{self, time::uptime},
    prelude::*,
};

use crate::config::TelemetryOptions;

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

struct Recorder {
    handle: PrometheusHandle,
    _upkeep: thread::JoinHandle<()>,
}

static RECORDER: OnceLock<Recorder> = OnceLock::new();

/// Keeps a thread-scoped subscriber installed (if any) and flushes the
/// Chrome trace on drop.
pub struct TelemetryGuard {
    _subscriber: Option<tracing::subscriber::DefaultGuard>,
    _chrome: Option<FlushGuard>,
}

/// Install the process-wide Prometheus recorder once and describe the
/// stream metrics. Later calls return the same handle.
pub fn init_metrics_recorder() -> &'static PrometheusHandle {
    let recorder = RECORDER.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("another metrics recorder is already global; /metrics stays empty");
        }
        describe_stream_metrics();

        let upkeep = handle.clone();
        let upkeep = spawn_thread("metrics-upkeep", move || {
            loop {
                thread::sleep(UPKEEP_INTERVAL);
                upkeep.run_upkeep();
            }
        })
        .expect("failed to spawn metrics upkeep thread");

        Recorder {
            handle,
            _upkeep: upkeep,
        }
    });
    &recorder.handle
}

/// The installed recorder's handle, if `init_metrics_recorder` ran.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    RECORDER.get().map(|recorder| &recorder.handle)
}

fn describe_stream_metrics() {
    describe_gauge!("stream_pipeline_fps", "Smoothed frames per second of the running pipeline");
    describe_counter!("stream_frames_published_total", "Frames published to viewers");
    describe_counter!(
        "stream_detection_errors_total",
        "Cycles that published a frame without detections because detection failed"
    );
    describe_histogram!(
        "stream_frame_interval_seconds",
        Unit::Seconds,
        "Time between consecutive publications"
    );
    describe_histogram!(
        "stream_stage_latency_seconds",
        Unit::Seconds,
        "Per-stage latency of a pipeline cycle"
    );
    describe_gauge!("stream_viewers", "Connected streaming viewers by kind");
}

/// Install the subscriber for the current thread. Log lines go through an
/// `RUST_LOG` filter (default `info`); spans also go to a Chrome trace file
/// when one is configured.
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    install(opts, false)
}

/// Install the same subscriber process-wide so threads the caller does not
/// spawn itself (actix workers) log too. An already installed global
/// subscriber is kept.
pub fn init_process(opts: &TelemetryOptions) -> TelemetryGuard {
    install(opts, true)
}

fn install(opts: &TelemetryOptions, global: bool) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut chrome_error = None;
    let (chrome, flush) = match opts.chrome_trace_path.as_deref().map(chrome_layer) {
        Some(Ok((layer, flush))) => (Some(layer), Some(flush)),
        Some(Err(err)) => {
            chrome_error = Some(err);
            (None, None)
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(chrome.map(|layer| layer.with_filter(filter_fn(|meta| meta.is_span()))))
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(uptime())
                .with_filter(filter),
        )
        .with(tracing_error::ErrorLayer::default());
    let guard = if global {
        if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
            tracing::warn!("keeping the existing global subscriber: {err}");
        }
        None
    } else {
        Some(tracing::subscriber::set_default(subscriber))
    };

    if let (Some(err), Some(path)) = (chrome_error, opts.chrome_trace_path.as_ref()) {
        tracing::warn!("chrome trace disabled, cannot write {}: {err}", path.display());
    }

    TelemetryGuard {
        _subscriber: guard,
        _chrome: flush,
    }
}

/// `thread::Builder::spawn` that carries the caller's subscriber into the
/// new thread.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(Clone::clone);
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn chrome_layer(path: &Path) -> io::Result<(ChromeLayer<Registry>, FlushGuard)> {
    let writer = File::create(path)?;
    Ok(ChromeLayerBuilder::new()
        .writer(writer)
        .include_args(true)
        .trace_style(TraceStyle::Threaded)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_threads_return_their_value() {
        let handle = spawn_thread("telemetry-test", || 40 + 2).unwrap();
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn metrics_recorder_is_installed_once() {
        let first = init_metrics_recorder() as *const PrometheusHandle;
        let second = init_metrics_recorder() as *const PrometheusHandle;
        assert_eq!(first, second);
        assert!(prometheus_handle().is_some());
    }

    #[test]
    fn process_subscriber_reaches_foreign_threads() {
        let _guard = init_process(&TelemetryOptions::default());
        assert!(tracing::dispatcher::has_been_set());

        let enabled = thread::spawn(|| tracing::enabled!(tracing::Level::WARN))
            .join()
            .unwrap();
        assert!(enabled);
    }

    #[test]
    fn unwritable_chrome_trace_keeps_logging() {
        let opts = TelemetryOptions {
            chrome_trace_path: Some("/nonexistent-dir/trace.json".into()),
        };
        let _guard = enter_runtime(&opts);
        tracing::info!("still logging");
    }
}
