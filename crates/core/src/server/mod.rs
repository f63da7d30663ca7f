use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::dispatch::{EsrganUpscaler, UpscaledPng};
use crate::error::UpscaleError;
use crate::types::{ModelChoice, ScaleFactor, UpscaleOptions};

pub const UPSCALE_PATH_HEADER: HeaderName = HeaderName::from_static("x-upscale-path");

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    upscaler: EsrganUpscaler,
    defaults: UpscaleOptions,
    max_upload_bytes: usize,
}

pub fn app_state(upscaler: EsrganUpscaler, defaults: UpscaleOptions, max_upload_bytes: usize) -> AppState {
    AppState {
        inner: Arc::new(AppStateInner {
            upscaler,
            defaults,
            max_upload_bytes,
        }),
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ModelStatus {
    pub scale: ScaleFactor,
    pub weight_file: String,
    pub present: bool,
    pub loaded: bool,
}

#[derive(Deserialize, Default)]
pub struct UpscaleQuery {
    pub scale: Option<String>,
    pub model: Option<String>,
    pub use_gpu: Option<bool>,
    pub preserve_aspect: Option<bool>,
}

impl UpscaleQuery {
    fn into_options(self, defaults: UpscaleOptions) -> Result<UpscaleOptions, AppError> {
        let scale = match self.scale.as_deref() {
            Some(raw) => raw
                .parse::<ScaleFactor>()
                .map_err(|e| AppError::BadRequest(format!("{e:#}")))?,
            None => defaults.scale,
        };
        let model_choice = match self.model.as_deref() {
            Some(raw) => raw
                .parse::<ModelChoice>()
                .map_err(|e| AppError::BadRequest(format!("{e:#}")))?,
            None => defaults.model_choice,
        };

        Ok(UpscaleOptions {
            scale,
            model_choice,
            use_gpu: self.use_gpu.unwrap_or(defaults.use_gpu),
            preserve_aspect: self.preserve_aspect.unwrap_or(defaults.preserve_aspect),
        })
    }
}

pub fn app_router(state: AppState) -> Router {
    let upload_limit = state.inner.max_upload_bytes;

    Router::new()
        .route("/api/health", get(health))
        .route("/api/models", get(list_models))
        .route(
            "/api/upscale",
            post(upscale).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelStatus>> {
    let upscaler = &state.inner.upscaler;
    let provisioner = upscaler.provisioner();

    let models = ScaleFactor::ALL
        .into_iter()
        .map(|scale| ModelStatus {
            scale,
            weight_file: provisioner.weight_path(scale).display().to_string(),
            present: provisioner.is_present(scale),
            loaded: upscaler.cache().is_loaded(scale),
        })
        .collect();

    Json(models)
}

async fn upscale(
    State(state): State<AppState>,
    Query(query): Query<UpscaleQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("request body is empty".to_string()));
    }

    let options = query.into_options(state.inner.defaults)?;
    let upscaler = state.inner.upscaler.clone();
    let span = tracing::info_span!("upscale", request_id = %Uuid::new_v4());

    async move {
        info!(
            bytes = body.len(),
            scale = %options.scale,
            model = %options.model_choice,
            use_gpu = options.use_gpu,
            "Upscale request"
        );

        let worker_span = tracing::Span::current();
        let result = tokio::task::spawn_blocking(move || {
            let _entered = worker_span.enter();
            upscaler.upscale_to_png(&body, &options)
        })
        .await
        .map_err(|e| AppError::Internal(format!("task join error: {e}")))??;

        if let Some(reason) = result.fallback_reason.as_deref() {
            warn!(scale = %options.scale, %reason, "Served Lanczos fallback");
        }

        Ok::<_, AppError>(png_attachment(result))
    }
    .instrument(span)
    .await
}

fn png_attachment(result: UpscaledPng) -> Response {
    let headers = [
        (header::CONTENT_TYPE, "image/png".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", result.filename),
        ),
        (UPSCALE_PATH_HEADER, result.path.to_string()),
    ];
    (StatusCode::OK, headers, result.bytes).into_response()
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<UpscaleError> for AppError {
    fn from(err: UpscaleError) -> Self {
        match err {
            UpscaleError::Decode(_) | UpscaleError::InvalidScale { .. } => {
                AppError::BadRequest(err.to_string())
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}
