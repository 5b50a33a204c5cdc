use std::time::Instant;

use axum::extract::multipart::{Multipart, MultipartError, MultipartRejection};
use axum::extract::rejection::QueryRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pdfsift_core::llm::Summarizer;
use pdfsift_core::schema::{DocumentListResponse, ExtractResponse, SummaryResponse};
use pdfsift_core::storage;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{ApiError, ApiResult};
use crate::pipeline::{self, Upload};
use crate::state::{lock_db, AppState};

const MAX_PAGE_SIZE: i64 = 100;

/// Build the application router with all routes and middleware.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/extract", post(extract))
        .route("/documents", get(list_documents))
        .route("/documents/{id}", get(get_document))
        .route("/documents/{id}/summary", post(summarize_document))
        .route("/images/{filename}", get(get_image))
        .route("/workers/status", get(worker_status))
        .route("/llm/status", get(llm_status));

    let prefix = state.api_prefix().to_string();
    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health));
    let app = if prefix.is_empty() {
        app.merge(api)
    } else {
        app.nest(&prefix, api)
    };

    app.layer(DefaultBodyLimit::max(state.config.max_upload_bytes()))
        .layer(middleware::from_fn(process_time))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Stamp every response with the handling time in seconds.
async fn process_time(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let mut response = next.run(request).await;
    let elapsed = start.elapsed().as_secs_f64();
    if let Ok(value) = HeaderValue::from_str(&format!("{elapsed:.6}")) {
        response.headers_mut().insert("x-process-time", value);
    }
    response
}

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "message": format!("Welcome to {}", state.config.server.app_name),
        "version": env!("CARGO_PKG_VERSION"),
        "api_prefix": state.api_prefix(),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

#[derive(Debug, Deserialize)]
struct ExtractParams {
    include_summary: Option<bool>,
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("Uploaded file exceeds the size limit".to_string())
    } else {
        ApiError::BadRequest(format!("Invalid multipart body: {}", e.body_text()))
    }
}

async fn extract(
    State(state): State<AppState>,
    params: Result<Query<ExtractParams>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<ExtractResponse>> {
    let Query(params) = params.map_err(|e| ApiError::Unprocessable(e.body_text()))?;
    let mut multipart = multipart.map_err(|e| ApiError::Unprocessable(e.body_text()))?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;
        upload = Some(Upload {
            filename,
            bytes: bytes.to_vec(),
        });
        break;
    }
    let upload =
        upload.ok_or_else(|| ApiError::Unprocessable("Field 'file' is required".to_string()))?;

    let response =
        pipeline::process_upload(&state, upload, params.include_summary.unwrap_or(true)).await?;
    Ok(Json(response))
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExtractResponse>> {
    let db = state.db.clone();
    let record = tokio::task::spawn_blocking(move || lock_db(&db).get_document_record(&id))
        .await??
        .ok_or_else(|| ApiError::NotFound("Document not found".to_string()))?;
    Ok(Json(record.to_extract_response(state.api_prefix())))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    10
}

async fn list_documents(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Json<DocumentListResponse>> {
    let Query(ListParams { skip, limit }) =
        params.map_err(|e| ApiError::Unprocessable(e.body_text()))?;
    if skip < 0 {
        return Err(ApiError::Unprocessable(
            "skip must be greater than or equal to 0".to_string(),
        ));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(ApiError::Unprocessable(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }

    let db = state.db.clone();
    let (records, total) = tokio::task::spawn_blocking(move || {
        let db = lock_db(&db);
        Ok::<_, pdfsift_core::CoreError>((db.list_documents(skip, limit)?, db.count_documents()?))
    })
    .await??;

    let prefix = state.api_prefix();
    Ok(Json(DocumentListResponse {
        documents: records
            .iter()
            .map(|r| r.to_document_response(prefix))
            .collect(),
        total,
        skip,
        limit,
    }))
}

async fn get_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<Response> {
    if !storage::is_safe_filename(&filename) {
        return Err(ApiError::NotFound("Image not found".to_string()));
    }
    let path = state.image_dir.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ApiError::NotFound("Image not found".to_string()))
        }
        Err(e) => Err(ApiError::Internal(format!("read {}: {e}", path.display()))),
    }
}

async fn summarize_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SummaryResponse>> {
    Ok(Json(pipeline::summarize_document(&state, &id).await?))
}

async fn worker_status(State(state): State<AppState>) -> Json<Value> {
    let dirs = [state.image_dir.clone(), state.upload_dir.clone()];
    let disk_usage_bytes = tokio::task::spawn_blocking(move || {
        dirs.iter().map(|d| storage::dir_size(d)).sum::<u64>()
    })
    .await
    .unwrap_or(0);

    Json(json!({
        "file_cleanup_worker": state.cleanup.status(),
        "disk_usage_bytes": disk_usage_bytes,
    }))
}

async fn llm_status(State(state): State<AppState>) -> Json<Value> {
    let status = match &state.summarizer {
        Some(summarizer) => summarizer.status().await,
        None => Summarizer::disabled_status(),
    };
    Json(json!({ "llm_service": status }))
}
