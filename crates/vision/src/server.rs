//! Actix Web server exposing the MJPEG stream and the JSON status endpoints.
//!
//! The server runs on a dedicated thread with its own actix runtime so the
//! acquisition thread never touches network code. Handlers only read the
//! [`FrameFeed`]; a viewer that disconnects just drops its subscription.

use std::{net::SocketAddr, thread, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use serde_json::to_string;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::{
    config::SettingsSnapshot,
    feed::FrameFeed,
    status::{DetectionsResponse, FpsResponse, StatusResponse},
    telemetry,
};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Camera stream</title>
<style>body{background:#111;color:#ddd;font-family:monospace;margin:1rem}img{max-width:100%}</style>
</head>
<body>
<img src="/stream" alt="live stream">
<pre id="status">connecting...</pre>
<script>
const out = document.getElementById('status');
const events = new EventSource('/stream_detections');
events.onmessage = (e) => {
  const d = JSON.parse(e.data);
  const fps = d.fps === null ? '--' : d.fps.toFixed(1);
  out.textContent = `frame ${d.sequence}  fps ${fps}\n` +
    d.detections.map(x => `${x.label} ${(x.confidence * 100).toFixed(0)}% ${x.location ?? ''}`).join('\n');
};
</script>
</body>
</html>
"#;

/// Shared state backing HTTP handlers.
pub struct ServerState {
    pub feed: FrameFeed,
    pub settings: SettingsSnapshot,
}

/// Register every route. Callers provide `web::Data<ServerState>`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index_route))
        .route("/stream", web::get().to(stream_handler))
        .route("/stream.mjpg", web::get().to(stream_handler))
        .route("/frame.jpg", web::get().to(frame_handler))
        .route("/detections", web::get().to(detections_handler))
        .route("/stream_detections", web::get().to(stream_detections_handler))
        .route("/fps", web::get().to(fps_handler))
        .route("/settings", web::get().to(settings_handler))
        .route("/status", web::get().to(status_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

/// Handle for the server thread.
pub struct StreamServer {
    local_addrs: Vec<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamServer {
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Signal the server to stop and block until the thread exits.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Bind `host:port` and serve on a dedicated thread. Returns after the bind
/// succeeded or failed.
pub fn spawn_stream_server(
    feed: FrameFeed,
    settings: SettingsSnapshot,
    host: &str,
    port: u16,
) -> Result<StreamServer> {
    let bind_addr = (host.to_string(), port);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound_tx, bound_rx) = crossbeam_channel::bounded::<std::io::Result<Vec<SocketAddr>>>(1);

    let handle = telemetry::spawn_thread("stream-http-server", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(ServerState {
                        feed: feed.clone(),
                        settings: settings.clone(),
                    }))
                    .configure(configure)
            })
            .bind(bind_addr);
            let server = match server {
                Ok(server) => server,
                Err(err) => {
                    let _ = bound_tx.send(Err(err));
                    return Ok(());
                }
            };
            let _ = bound_tx.send(Ok(server.addrs()));
            let server = server.run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn HTTP server thread")?;

    let local_addrs = bound_rx
        .recv()
        .map_err(|_| anyhow!("HTTP server thread exited before binding"))?
        .with_context(|| format!("Failed to bind {host}:{port}"))?;
    info!("serving on {}", format_addrs(&local_addrs));

    Ok(StreamServer {
        local_addrs,
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

fn format_addrs(addrs: &[SocketAddr]) -> String {
    addrs
        .iter()
        .map(|addr| format!("http://{addr}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Keeps the `stream_viewers` gauge in step with live stream bodies.
struct ViewerGuard {
    kind: &'static str,
}

impl ViewerGuard {
    fn new(kind: &'static str) -> Self {
        metrics::gauge!("stream_viewers", "kind" => kind).increment(1.0);
        Self { kind }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        metrics::gauge!("stream_viewers", "kind" => self.kind).decrement(1.0);
    }
}

fn multipart_part(sequence: u64, jpeg: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(jpeg.len() + 96);
    payload.extend_from_slice(b"--frame\r\n");
    payload.extend_from_slice(format!("X-Sequence: {sequence}\r\n").as_bytes());
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n");
    payload.extend_from_slice(format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes());
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

fn unavailable(feed: &FrameFeed) -> Option<HttpResponse> {
    let status = feed.status();
    status.is_terminal().then(|| {
        HttpResponse::ServiceUnavailable()
            .insert_header((header::RETRY_AFTER, "1"))
            .body(format!("pipeline {status}"))
    })
}

/// Stream the MJPEG feed, one part per publication this viewer observes.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    if let Some(response) = unavailable(&state.feed) {
        return response;
    }
    let mut subscription = state.feed.subscribe();
    let stream = stream! {
        let _viewer = ViewerGuard::new("mjpeg");
        loop {
            match subscription.next().await {
                Ok(published) => {
                    let Some(jpeg) = published.jpeg.as_ref() else {
                        continue;
                    };
                    yield Ok::<Bytes, actix_web::Error>(multipart_part(published.sequence, jpeg));
                }
                Err(err) => {
                    debug!("mjpeg viewer done: {err}");
                    break;
                }
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        ))
        .streaming(stream)
}

/// Return the latest encoded frame.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.feed.latest() {
        Some(published) => match published.jpeg.clone() {
            Some(jpeg) => HttpResponse::Ok()
                .insert_header(("X-Sequence", published.sequence.to_string()))
                .content_type("image/jpeg")
                .body(jpeg),
            None => HttpResponse::NoContent().finish(),
        },
        None => HttpResponse::NoContent().finish(),
    }
}

/// Return the most recent detection snapshot as JSON.
async fn detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.feed.latest() {
        Some(published) => HttpResponse::Ok().json(DetectionsResponse::from(&*published)),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream detection snapshots as Server-Sent Events.
async fn stream_detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    if let Some(response) = unavailable(&state.feed) {
        return response;
    }
    let mut subscription = state.feed.subscribe();
    let stream = stream! {
        let _viewer = ViewerGuard::new("sse");
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 500\n\n"));
        loop {
            let next = match actix_web::rt::time::timeout(SSE_KEEP_ALIVE, subscription.next()).await {
                Ok(next) => next,
                Err(_) => {
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b": keep-alive\n\n"));
                    continue;
                }
            };
            match next {
                Ok(published) => match to_string(&DetectionsResponse::from(&*published)) {
                    Ok(json) => {
                        let chunk = format!("id: {}\ndata: {json}\n\n", published.sequence);
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    }
                    Err(err) => {
                        let chunk = format!("event: error\ndata: {err}\n\n");
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    }
                },
                Err(err) => {
                    let chunk = format!("event: end\ndata: {err}\n\n");
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    break;
                }
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .streaming(stream)
}

async fn fps_handler(state: web::Data<ServerState>) -> HttpResponse {
    let latest = state.feed.latest();
    HttpResponse::Ok().json(FpsResponse::of(latest.as_deref()))
}

async fn settings_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(&state.settings)
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(StatusResponse::from(&state.feed.snapshot()))
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().body("metrics recorder not installed"),
    }
}

async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}
