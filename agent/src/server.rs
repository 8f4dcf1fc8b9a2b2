use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post},
};
use deadpool_postgres::Pool;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use orcein_common::events::Event;
use orcein_common::types::{JobType, SlideStatus};

use crate::db;
use crate::health::HealthState;
use crate::models::SlideUpdate;
use crate::scanner::Scanner;
use crate::tiles::{SlideRef, TileError, TileService};
use crate::worker::{WorkerDeps, chain_job};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub tiles: Arc<TileService>,
    pub health: Arc<HealthState>,
    pub derived_dir: PathBuf,
    pub scanner: Option<Scanner>,
    pub worker: WorkerDeps,
    /// Relayed event frames from the cross-process channel; SSE clients
    /// subscribe here so they see events no matter which process emitted.
    pub events: broadcast::Sender<Bytes>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(healthz))
        .route("/v1/slides", get(list_slides))
        .route("/v1/slides/pending-ocr", get(list_pending_ocr))
        .route("/v1/slides/{id}", get(get_slide).delete(delete_slide))
        .route("/v1/slides/{id}/jobs", get(list_slide_jobs))
        .route("/v1/slides/{id}/ocr-retry", post(retry_ocr))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/outbox", get(list_outbox))
        .route("/v1/outbox/ack", post(ack_outbox))
        .route("/v1/slides/{id}/manifest.json", get(get_manifest))
        .route("/v1/slides/{id}/thumb.jpg", get(get_thumb))
        .route("/v1/slides/{id}/tiles/{z}/{x}/{y}", get(get_tile))
        .route("/v1/slides/{id}/preview", post(trigger_preview))
        .route("/v1/slides/{id}/retry", post(retry_slide))
        .route("/v1/scanner/scan", post(trigger_scan))
        .route("/v1/events", get(events))
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(router: Router, port: u16, cancel: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    tracing::info!(%addr, "starting agent HTTP server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind HTTP port")?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("HTTP server stopped");
    Ok(())
}

fn internal(e: impl std::fmt::Debug) -> (StatusCode, String) {
    tracing::error!(error = ?e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal error".to_string(),
    )
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = serde_json::to_value(state.health.snapshot()).unwrap_or_default();
    body["tiles_pending"] = serde_json::json!(state.tiles.pending_count());
    Json(body)
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    offset: i64,
    limit: Option<i64>,
    /// Exact match on the original filename
    filename: Option<String>,
}

async fn list_slides(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if let Some(ref filename) = query.filename {
        let slides = db::find_slides_by_filename(&state.pool, filename)
            .await
            .map_err(internal)?;
        return Ok(Json(slides));
    }
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let slides = db::list_slides(&state.pool, query.offset.max(0), limit)
        .await
        .map_err(internal)?;
    Ok(Json(slides))
}

async fn list_pending_ocr(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let slides = db::list_pending_ocr(&state.pool).await.map_err(internal)?;
    Ok(Json(slides))
}

async fn list_slide_jobs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let jobs = db::list_jobs_for_slide(&state.pool, &id)
        .await
        .map_err(internal)?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<Response, (StatusCode, String)> {
    let job = db::get_job(&state.pool, id).await.map_err(internal)?;
    match job {
        Some(job) => Ok(Json(job).into_response()),
        None => Err((StatusCode::NOT_FOUND, format!("job {id} not found"))),
    }
}

/// Mark a slide's label for another OCR pass by the external collaborator.
async fn retry_ocr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let Some(slide) = db::get_slide(&state.pool, &id).await.map_err(internal)? else {
        return Err((StatusCode::NOT_FOUND, format!("slide {id} not found")));
    };
    if slide.dsmeta_path.is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            "slide has no label image to OCR".to_string(),
        ));
    }
    db::update_slide(
        &state.pool,
        &id,
        &SlideUpdate {
            ocr_status: Some(orcein_common::types::OcrStatus::Pending),
            ..Default::default()
        },
    )
    .await
    .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
struct OutboxQuery {
    limit: Option<i64>,
}

/// Unsynced outbox events, oldest first, for the external sync process.
async fn list_outbox(
    State(state): State<AppState>,
    Query(query): Query<OutboxQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let events = db::list_unsynced_outbox(&state.pool, limit)
        .await
        .map_err(internal)?;
    Ok(Json(events))
}

#[derive(Deserialize)]
struct AckRequest {
    ids: Vec<i64>,
}

async fn ack_outbox(
    State(state): State<AppState>,
    Json(req): Json<AckRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let acked = db::mark_outbox_synced(&state.pool, &req.ids)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "acked": acked })))
}

async fn get_slide(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let slide = db::get_slide(&state.pool, &id).await.map_err(internal)?;
    match slide {
        Some(slide) => Ok(Json(slide).into_response()),
        None => Err((StatusCode::NOT_FOUND, format!("slide {id} not found"))),
    }
}

/// Delete a slide: jobs cascade with the row, local artefacts are removed
/// and a CLEANUP job handles whatever was published remotely.
async fn delete_slide(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let Some(slide) = db::get_slide(&state.pool, &id).await.map_err(internal)? else {
        return Err((StatusCode::NOT_FOUND, format!("slide {id} not found")));
    };

    // Enqueue remote cleanup while the slide row still exists
    if state.worker.store.is_some()
        && let Err(e) = chain_job(&state.worker, &slide, JobType::Cleanup, None).await
    {
        tracing::warn!(slide_id = %id, error = ?e, "failed to enqueue cleanup");
    }

    db::delete_slide(&state.pool, &id).await.map_err(internal)?;
    state.tiles.evict(&id);

    let slide_dir = state.derived_dir.join(&id);
    if let Err(e) = tokio::fs::remove_dir_all(&slide_dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(slide_id = %id, error = %e, "failed to remove derived dir");
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn serve_file(
    path: PathBuf,
    content_type: &'static str,
) -> Result<Response, (StatusCode, String)> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err((StatusCode::NOT_FOUND, "not found".to_string()))
        }
        Err(e) => Err(internal(e)),
    }
}

async fn get_manifest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    serve_file(
        state.derived_dir.join(&id).join("manifest.json"),
        "application/json",
    )
    .await
}

async fn get_thumb(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    serve_file(state.derived_dir.join(&id).join("thumb.jpg"), "image/jpeg").await
}

#[axum::debug_handler]
async fn get_tile(
    State(state): State<AppState>,
    Path((id, z, x, y)): Path<(String, u32, u32, String)>,
) -> Response {
    let Some(y) = y.strip_suffix(".jpg").and_then(|y| y.parse::<u32>().ok()) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };

    let slide = match db::get_slide(&state.pool, &id).await {
        Ok(Some(slide)) => slide,
        Ok(None) => return (StatusCode::NOT_FOUND, "unknown slide").into_response(),
        Err(e) => return internal(e).into_response(),
    };

    if slide.width <= 0 || slide.height <= 0 {
        // Still in P0; the viewer should come back shortly
        return ((StatusCode::SERVICE_UNAVAILABLE), [("Retry-After", "1")], "slide not ready")
            .into_response();
    }

    let slide_ref = SlideRef {
        id: slide.id.clone(),
        raw_path: PathBuf::from(&slide.raw_path),
        width: slide.width as u32,
        height: slide.height as u32,
        max_level: slide.max_level.max(0) as u32,
    };

    match state.tiles.get_tile(&slide_ref, z, x, y).await {
        Ok(path) => match tokio::fs::read(&path).await {
            Ok(bytes) => (
                [
                    (header::CONTENT_TYPE, "image/jpeg"),
                    (header::CACHE_CONTROL, "public, max-age=31536000"),
                ],
                bytes,
            )
                .into_response(),
            Err(e) => internal(e).into_response(),
        },
        Err(TileError::Bounds { .. }) => {
            (StatusCode::NOT_FOUND, "tile out of bounds").into_response()
        }
        Err(TileError::Pending) => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("Retry-After", "1")],
            "tile generation in progress",
        )
            .into_response(),
        Err(TileError::Timeout(e)) => (StatusCode::GATEWAY_TIMEOUT, e).into_response(),
        Err(e) => internal(e).into_response(),
    }
}

async fn trigger_preview(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    if state.worker.preview.is_none() || state.worker.store.is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            "remote preview is not configured".to_string(),
        ));
    }
    let Some(slide) = db::get_slide(&state.pool, &id).await.map_err(internal)? else {
        return Err((StatusCode::NOT_FOUND, format!("slide {id} not found")));
    };

    let enqueued = chain_job(&state.worker, &slide, JobType::Preview, None)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "enqueued": enqueued })).into_response())
}

/// Manual retry for a failed slide: reset to queued and re-enqueue P0.
async fn retry_slide(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let Some(slide) = db::get_slide(&state.pool, &id).await.map_err(internal)? else {
        return Err((StatusCode::NOT_FOUND, format!("slide {id} not found")));
    };

    db::update_slide(
        &state.pool,
        &id,
        &SlideUpdate {
            status: Some(SlideStatus::Queued),
            ..Default::default()
        },
    )
    .await
    .map_err(internal)?;

    let enqueued = chain_job(&state.worker, &slide, JobType::P0, None)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "enqueued": enqueued })).into_response())
}

async fn trigger_scan(
    State(state): State<AppState>,
) -> Result<Response, (StatusCode, String)> {
    let Some(scanner) = state.scanner.clone() else {
        return Err((
            StatusCode::BAD_REQUEST,
            "scanner is not enabled".to_string(),
        ));
    };

    match scanner.try_scan().await.map_err(internal)? {
        Some(stats) => Ok(Json(serde_json::json!({
            "skipped": false,
            "discovered": stats.discovered,
            "registered": stats.registered,
        }))
        .into_response()),
        None => Ok(Json(serde_json::json!({ "skipped": true })).into_response()),
    }
}

/// Bridge the cross-process event channel onto an SSE stream. Slow clients
/// that lag the broadcast buffer miss events rather than stalling it.
async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|frame| {
        let frame = frame.ok()?;
        let event: Event = serde_json::from_slice(&frame).ok()?;
        let sse = SseEvent::default().event(event.kind);
        Some(Ok::<_, Infallible>(match sse.json_data(&event.payload) {
            Ok(sse) => sse,
            Err(_) => SseEvent::default().comment("unserializable event"),
        }))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
