use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::{HeaderName, HeaderValue, Method, StatusCode, header::CONTENT_DISPOSITION},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::{Config, normalize_origin},
    delivery::{
        DOWNLOAD_FILENAME_HEADER, attachment_response, file_body, media_filename, open_file_body,
    },
    downloader::Downloader,
    error::ApiError,
    extractor::MediaInfo,
    jobs::{JobStore, JobView},
    options::{DownloadOptions, RequestParams},
};

#[derive(Clone)]
pub struct AppState {
    pub downloader: Arc<Downloader>,
    pub jobs: JobStore,
}

impl AppState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            downloader: Arc::new(Downloader::from_config(config)),
            jobs: JobStore::new(config.job_retention, config.max_jobs),
        }
    }
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    ok: bool,
    info: MediaInfo,
    filename: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobCreatedResponse {
    ok: bool,
    job_id: Uuid,
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    ok: bool,
    #[serde(flatten)]
    job: JobView,
}

pub fn build_router(state: AppState, config: &Config) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", get(info_query).post(info_json))
        .route(
            "/api/direct-download",
            get(direct_download_query).post(direct_download_json),
        )
        .route("/api/jobs", axum::routing::post(create_job))
        .route("/api/jobs/{id}", get(job_status).delete(delete_job))
        .route("/api/jobs/{id}/file", get(job_file))
        .fallback_service(ServeDir::new(&config.static_dir))
        .with_state(state)
        .layer(build_cors_layer(config))
        .layer(TraceLayer::new_for_http())
}

fn build_cors_layer(config: &Config) -> CorsLayer {
    let allow_origin = match &config.allowed_origins {
        None => AllowOrigin::from(Any),
        Some(origins) => {
            info!("CORS allow-list loaded with {} origin(s)", origins.len());
            let origins = Arc::new(origins.clone());
            AllowOrigin::predicate(move |origin: &HeaderValue, _| {
                let normalized = origin.to_str().ok().and_then(normalize_origin);
                let allowed = normalized
                    .as_ref()
                    .is_some_and(|value| origins.contains(value));
                debug!("CORS origin {:?} allowed={}", origin, allowed);
                allowed
            })
        }
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ])
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// POST bodies are parsed as JSON whatever their Content-Type says.
fn parse_json_params(body: &Bytes) -> Result<RequestParams, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RequestParams::default());
    }

    serde_json::from_slice(body)
        .map_err(|error| ApiError::bad_request(format!("Invalid JSON body: {error}")))
}

/// Query strings axum cannot decode still get the JSON error shape.
fn query_params(
    query: Result<Query<RequestParams>, QueryRejection>,
) -> Result<RequestParams, ApiError> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::not_found(format!("Unknown job {raw}.")))
}

async fn info_query(
    State(state): State<AppState>,
    query: Result<Query<RequestParams>, QueryRejection>,
) -> Result<Json<InfoResponse>, ApiError> {
    info(state, query_params(query)?).await
}

async fn info_json(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<InfoResponse>, ApiError> {
    info(state, parse_json_params(&body)?).await
}

async fn info(state: AppState, params: RequestParams) -> Result<Json<InfoResponse>, ApiError> {
    let options = DownloadOptions::from_params(params)?;
    let media = state.downloader.probe(&options).await?;
    let filename = media_filename(&media, options.extension());

    Ok(Json(InfoResponse {
        ok: true,
        info: media,
        filename,
    }))
}

async fn direct_download_query(
    State(state): State<AppState>,
    query: Result<Query<RequestParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    direct_download(state, query_params(query)?).await
}

async fn direct_download_json(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    direct_download(state, parse_json_params(&body)?).await
}

async fn direct_download(state: AppState, params: RequestParams) -> Result<Response, ApiError> {
    let wants_stream = params.wants_stream();
    let options = DownloadOptions::from_params(params)?;

    if wants_stream {
        let stream = state.downloader.open_stream(&options).await?;
        return attachment_response(&stream.filename, stream.body, None);
    }

    let (dir, file) = {
        let _permit = state.downloader.acquire().await?;
        state.downloader.download(&options).await?
    };

    // The temp folder goes away once the body has been sent or dropped.
    let body = file_body(&file.path, dir).await?;
    attachment_response(&file.filename, body, Some(file.size))
}

async fn create_job(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let options = DownloadOptions::from_params(parse_json_params(&body)?)?;
    let job_id = state
        .jobs
        .submit(options, Arc::clone(&state.downloader))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(JobCreatedResponse { ok: true, job_id }),
    )
        .into_response())
}

async fn job_status(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let id = parse_job_id(&raw_id)?;
    let job = state
        .jobs
        .status(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Unknown job {id}.")))?;

    Ok(Json(JobStatusResponse { ok: true, job }))
}

async fn job_file(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&raw_id)?;
    let completed = state.jobs.completed_file(id).await?;
    let body = open_file_body(completed.file, ());
    attachment_response(&completed.filename, body, Some(completed.size))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_job_id(&raw_id)?;
    if !state.jobs.remove(id).await {
        return Err(ApiError::not_found(format!("Unknown job {id}.")));
    }

    Ok(Json(serde_json::json!({ "ok": true })))
}
