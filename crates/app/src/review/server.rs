//! Actix Web control surface for review sessions.
//!
//! The server runs on a dedicated thread so the playback threads never share a
//! runtime with Actix. It exposes room lifecycle, transport commands, the
//! MJPEG/SSE feeds, feedback submission, and the footage export.

use std::{path::PathBuf, sync::Arc, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use serde::Deserialize;
use serde_json::{json, to_string};
use tracing::error;

use detect_core::Detector;

use super::{
    config::ReviewConfig,
    data::DetectionsResponse,
    error::ReviewError,
    feedback::{FeedbackEncoder, FeedbackPayload},
    playback,
    publisher::{Publisher, RoomHub},
    registry::SessionRegistry,
    session::Session,
    storage::MediaStore,
    telemetry,
};

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) hub: Arc<RoomHub>,
    pub(crate) detector: Arc<dyn Detector>,
    pub(crate) media: Arc<MediaStore>,
    pub(crate) feedback: Arc<FeedbackEncoder>,
    pub(crate) config: ReviewConfig,
}

/// Handle for the HTTP server thread.
pub(crate) struct ReviewServer {
    handle: std::thread::JoinHandle<()>,
}

impl ReviewServer {
    /// Block until the server thread exits. Actix installs its own signal
    /// handlers, so Ctrl-C drains connections and unblocks this join.
    pub(crate) fn wait(self) {
        let _ = self.handle.join();
    }
}

/// Spawn the HTTP server thread and return a handle to join it.
pub(crate) fn spawn(state: Arc<ServerState>) -> Result<ReviewServer> {
    let host = state.config.host.clone();
    let port = state.config.port;
    let handle = telemetry::spawn_thread("review-http".to_string(), move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::from(state.clone()))
                    .app_data(web::PayloadConfig::new(512 * 1024 * 1024))
                    .route("/join/{room}", web::post().to(join_handler))
                    .route("/leave/{room}", web::post().to(leave_handler))
                    .route("/start-session/{room}", web::post().to(start_session_handler))
                    .route("/pause/{room}", web::post().to(pause_handler))
                    .route("/unpause/{room}", web::post().to(unpause_handler))
                    .route("/reverse/{room}", web::post().to(reverse_handler))
                    .route("/forward/{room}", web::post().to(forward_handler))
                    .route("/stop/{room}", web::post().to(stop_handler))
                    .route("/upload-video", web::post().to(upload_handler))
                    .route("/feedback/{room}", web::post().to(feedback_handler))
                    .route("/export/{room}", web::get().to(export_handler))
                    .route("/frame/{room}.jpg", web::get().to(frame_handler))
                    .route("/stream/{room}.mjpg", web::get().to(stream_handler))
                    .route("/detections/{room}", web::get().to(detections_handler))
                    .route("/events/{room}", web::get().to(events_handler))
                    .route("/metrics", web::get().to(metrics_handler))
                    .route("/healthz", web::get().to(healthz_handler))
            })
            .bind((host.as_str(), port))?
            .run();

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn HTTP server thread")?;
    Ok(ReviewServer { handle })
}

fn error_response(err: ReviewError) -> HttpResponse {
    let body = json!({ "error": err.to_string() });
    match err {
        ReviewError::SessionNotFound(_) => HttpResponse::NotFound().json(body),
        ReviewError::AlreadyExists(_) => HttpResponse::Conflict().json(body),
        ReviewError::InvalidFormat(_) => HttpResponse::UnsupportedMediaType().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

fn with_session(
    state: &ServerState,
    room: &str,
    apply: impl FnOnce(&Session),
) -> HttpResponse {
    match state.registry.get(room) {
        Ok(session) => {
            apply(&session);
            HttpResponse::Ok().json(json!({ "ok": true }))
        }
        Err(err) => error_response(err),
    }
}

async fn join_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    let room = path.into_inner();
    match state.registry.create(&room) {
        Ok(_) => {
            state.hub.create(&room);
            HttpResponse::Ok().json(json!({ "ok": true, "room": room }))
        }
        Err(err) => error_response(err),
    }
}

async fn leave_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    let room = path.into_inner();
    match state.registry.remove(&room) {
        Ok(()) => {
            state.hub.drop_room(&room);
            HttpResponse::Ok().json(json!({ "ok": true }))
        }
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
struct StartSessionRequest {
    video: PathBuf,
    diagnosis: Option<String>,
    #[serde(default)]
    save: bool,
}

async fn start_session_handler(
    path: web::Path<String>,
    body: web::Json<StartSessionRequest>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let room = path.into_inner();
    let publisher: Arc<dyn Publisher> = state.hub.clone();
    let result = playback::start_session(
        &state.registry,
        &room,
        &body.video,
        body.diagnosis.as_deref().unwrap_or(""),
        body.save,
        state.detector.clone(),
        publisher,
        state.media.clone(),
        state.config.jpeg_quality,
    );
    match result {
        Ok(()) => HttpResponse::Ok().json(json!({ "ok": true })),
        Err(err) => error_response(err),
    }
}

async fn pause_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    with_session(&state, &path.into_inner(), Session::pause)
}

async fn unpause_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    with_session(&state, &path.into_inner(), Session::unpause)
}

async fn reverse_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    with_session(&state, &path.into_inner(), Session::reverse)
}

async fn forward_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    with_session(&state, &path.into_inner(), Session::forward)
}

async fn stop_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    with_session(&state, &path.into_inner(), Session::stop)
}

#[derive(Deserialize)]
struct UploadQuery {
    filename: String,
}

/// Accept a raw video body, stash it under the uploads directory, and probe
/// it so the client learns the frame geometry up front.
async fn upload_handler(
    query: web::Query<UploadQuery>,
    body: Bytes,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let path = match state.media.save_upload(&query.filename, &body) {
        Ok(path) => path,
        Err(err) => return error_response(err),
    };
    match video_source::probe(&path) {
        Ok(info) => HttpResponse::Ok().json(json!({
            "path": path,
            "width": info.width,
            "height": info.height,
            "frames": info.total_frames,
        })),
        Err(err) => {
            let _ = std::fs::remove_file(&path);
            error_response(ReviewError::InvalidFormat(format!(
                "{}: {err}",
                query.filename
            )))
        }
    }
}

async fn feedback_handler(
    path: web::Path<String>,
    body: web::Json<FeedbackPayload>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let room = path.into_inner();
    let session = match state.registry.get(&room) {
        Ok(session) => session,
        Err(err) => return error_response(err),
    };
    match state.feedback.submit(&session, &body) {
        Ok(index) => HttpResponse::Ok().json(json!({ "ok": true, "index": index })),
        Err(err) => error_response(err),
    }
}

async fn export_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    let room = path.into_inner();
    let session = match state.registry.get(&room) {
        Ok(session) => session,
        Err(err) => return error_response(err),
    };
    match state.media.export_zip(&room, &session.diagnosis()) {
        Ok((name, bytes)) => HttpResponse::Ok()
            .content_type("application/zip")
            .insert_header((
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ))
            .body(bytes),
        Err(err) => error_response(err),
    }
}

/// Return a single JPEG snapshot of the room's latest frame.
async fn frame_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    let room = path.into_inner();
    let Some(feed) = state.hub.get(&room) else {
        return error_response(ReviewError::SessionNotFound(room));
    };
    match feed.latest() {
        Some(packet) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .body(packet.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream the room's MJPEG feed over a multipart response.
async fn stream_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    let room = path.into_inner();
    let Some(feed) = state.hub.get(&room) else {
        return error_response(ReviewError::SessionNotFound(room));
    };
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(33));
        loop {
            interval.tick().await;
            if let Some(packet) = feed.latest() {
                let mut payload = Vec::with_capacity(packet.jpeg.len() + 64);
                payload.extend_from_slice(b"--frame\r\n");
                payload.extend_from_slice(
                    format!("X-Sequence: {}\r\n", packet.frame_index).as_bytes(),
                );
                payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
                payload.extend_from_slice(&packet.jpeg);
                payload.extend_from_slice(b"\r\n");
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

/// Return the room's most recent detection snapshot as JSON.
async fn detections_handler(
    path: web::Path<String>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let room = path.into_inner();
    let Some(feed) = state.hub.get(&room) else {
        return error_response(ReviewError::SessionNotFound(room));
    };
    match feed.latest() {
        Some(packet) => HttpResponse::Ok().json(DetectionsResponse {
            frame_index: packet.frame_index,
            timestamp_ms: packet.timestamp_ms,
            detections: &packet.detections,
        }),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream detection snapshots as Server-Sent Events. A finished session that
/// saved footage terminates the stream with an `end` event carrying the room
/// name and diagnosis.
async fn events_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    let room = path.into_inner();
    let Some(feed) = state.hub.get(&room) else {
        return error_response(ReviewError::SessionNotFound(room));
    };
    let stream = stream! {
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 500\n\n"));
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(250));
        let mut last_index: Option<u64> = None;
        loop {
            interval.tick().await;
            if let Some(note) = feed.note() {
                match to_string(&note) {
                    Ok(json) => {
                        let chunk = format!("event: end\ndata: {json}\n\n");
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    }
                    Err(err) => {
                        let chunk = format!("event: error\ndata: {err}\n\n");
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    }
                }
                break;
            }
            let packet = feed.latest();
            match packet {
                Some(packet) if last_index != Some(packet.frame_index) => {
                    last_index = Some(packet.frame_index);
                    let payload = DetectionsResponse {
                        frame_index: packet.frame_index,
                        timestamp_ms: packet.timestamp_ms,
                        detections: &packet.detections,
                    };
                    match to_string(&payload) {
                        Ok(json) => {
                            let mut chunk = String::with_capacity(json.len() + 32);
                            chunk.push_str("id: ");
                            chunk.push_str(&packet.frame_index.to_string());
                            chunk.push('\n');
                            chunk.push_str("data: ");
                            chunk.push_str(&json);
                            chunk.push_str("\n\n");
                            yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                        }
                        Err(err) => {
                            let chunk = format!("event: error\ndata: {err}\n\n");
                            yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                        }
                    }
                }
                _ => {
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b": keep-alive\n\n"));
                }
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

async fn healthz_handler() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "ok": true }))
}
