use std::{sync::Arc, time::Instant};

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE}, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::{
    auth_endpoints,
    configs::{HttpServer, Settings},
    download::{download, find_demo_image},
    instagram_client::InstagramApi,
    instagram_url::{is_valid_instagram_url, normalize_instagram_url, UrlError},
    media_type::{ApiResponse, MediaItem, Quality, IMAGE_JPEG},
    pages,
    resolver::{MediaResolver, ResolveError, ResolverOptions},
    string_util::format_file_size,
    webhook,
};

const SERVICE_NAME: &str = "InstaSave API";

/// Everything request handlers need, cheap to clone
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub instagram: Arc<dyn InstagramApi + Send + Sync + 'static>,
    pub resolver: Arc<dyn MediaResolver + Send + Sync + 'static>,
    /// Used for proxying demo images
    pub http_client: reqwest::Client,
    pub started_at: Instant,
    pub metrics: Option<PrometheusHandle>,
}

/// Creates an HTTP server with the web pages and the JSON API
pub async fn run_api_server(http_config: &HttpServer, state: AppState) -> anyhow::Result<()> {
    let app = router(state);

    let port = http_config.port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Listening on port {port}");
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/", get(|| async { Html(pages::render_home()) }))
        .route("/private", get(|| async { Html(pages::render_private()) }))
        .route("/help", get(|| async { Html(pages::render_help()) }))
        .route("/privacy", get(|| async { Html(pages::render_privacy()) }))
        .route("/terms", get(|| async { Html(pages::render_terms()) }))
        .route("/auth/login", get(auth_endpoints::login))
        .route("/auth/callback", get(auth_endpoints::callback))
        .route("/auth/success", get(auth_endpoints::success_page))
        .route("/api/auth/callback", get(auth_endpoints::legacy_callback))
        .route("/api/auth/refresh", post(auth_endpoints::refresh))
        .route("/api/user-media", get(auth_endpoints::user_media))
        .route("/api/resolve", post(resolve))
        .route("/api/download-demo", get(download_demo))
        .route("/api/webhook", get(webhook::verify).post(webhook::receive))
        .route("/api/health", get(health))
        .route("/api/debug-env", get(debug_env))
        .route("/metrics", get(render_metrics))
        .layer(cors)
        .with_state(state)
}

pub(crate) fn json_response<T: serde::Serialize>(status: StatusCode, body: ApiResponse<T>) -> Response {
    (status, Json(body)).into_response()
}

impl IntoResponse for ResolveError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ResolveError::RateLimited =>
                (StatusCode::TOO_MANY_REQUESTS, ApiResponse::fail("Rate limit exceeded. Please try again later.", "Too many requests")),
            ResolveError::NotFound =>
                (StatusCode::NOT_FOUND, ApiResponse::fail(
                    "Content not found or not accessible",
                    "The Instagram content could not be found or may have been deleted",
                )),
            ResolveError::Private =>
                (StatusCode::FORBIDDEN, ApiResponse::fail(
                    "This content is private",
                    "You need to be logged in and have access to this private content",
                )),
            ResolveError::Api { status, message } =>
                (
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    ApiResponse::fail(message.clone(), "Instagram API error"),
                ),
            ResolveError::InvalidUrl | ResolveError::NotConfigured | ResolveError::Other(_) =>
                (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::fail("Failed to process Instagram content", self.to_string())),
        };
        json_response::<()>(status, body)
    }
}

/// Accepts `{"url": "...", "quality": "..."}` and answers with the download options of the post.
/// `quality` is optional and limits the best offered rendition.
async fn resolve(State(state): State<AppState>, body: Bytes) -> Response {
    let request = serde_json::from_slice::<serde_json::Value>(&body).unwrap_or_default();
    let url = request.get("url")
        .and_then(|u| u.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let Some(url) = url else {
        return json_response::<()>(StatusCode::BAD_REQUEST, ApiResponse::fail_without_message(UrlError::Missing.to_string()));
    };
    if !is_valid_instagram_url(&url) {
        return json_response::<()>(StatusCode::BAD_REQUEST, ApiResponse::fail_without_message(UrlError::NotInstagram.to_string()));
    }

    let normalized = normalize_instagram_url(&url);
    if !state.resolver.validate_access(&normalized).await {
        return json_response::<()>(
            StatusCode::FORBIDDEN,
            ApiResponse::fail_without_message("Content is not accessible or may be private"),
        );
    }

    let mut opts = ResolverOptions::default();
    if let Some(quality) = request.get("quality").and_then(|q| q.as_str()).and_then(Quality::parse) {
        opts.max_quality = quality;
    }

    match state.resolver.resolve(&normalized, &opts).await {
        Ok(media) => json_response::<MediaItem>(StatusCode::OK, ApiResponse::ok(media, "Content resolved successfully")),
        Err(err) => {
            error!("Resolve API error: {err}");
            err.into_response()
        },
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "environment": state.settings.env,
    }))
}

/// Shows which settings are present, never their values
async fn debug_env(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ig = &state.settings.instagram;
    let flag = |present: bool| if present { "Set" } else { "Missing" };
    let len = |v: &Option<String>| v.as_deref().map(str::len).unwrap_or(0);

    Json(json!({
        "environment": {
            "instagram_app_id": flag(len(&ig.app_id) > 0),
            "instagram_app_secret": flag(len(&ig.app_secret) > 0),
            "app_url": flag(!ig.app_url.is_empty()),
            "webhook_verify_token": flag(!state.settings.webhook.verify_token.is_empty()),
            "instagram_redirect_uri": flag(len(&ig.redirect_uri) > 0),
            "env": state.settings.env,
            "app_id_length": len(&ig.app_id),
            "secret_length": len(&ig.app_secret),
        },
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "message": "Environment variables check",
    }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct DemoDownloadParams {
    id: Option<String>,
    download: Option<String>,
}

/// Proxies one of the placeholder images so the browser can save it as a file.
async fn download_demo(
    Query(params): Query<DemoDownloadParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(id) = params.id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "Image ID required" }))).into_response();
    };
    let Some(image) = find_demo_image(&id) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "Demo image not found" }))).into_response();
    };

    let download_cfg = &state.settings.download;
    let url = image.url(&download_cfg.demo_base_url);
    let bytes = match download(&state.http_client, &url, download_cfg.file_max_size_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("Demo download error: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "Failed to download demo image" }))).into_response();
        },
    };

    info!("Serving demo image {} ({})", image.filename, format_file_size(bytes.len() as u64));
    let disposition = if params.download.as_deref() == Some("true") { "attachment" } else { "inline" };
    Response::builder()
        .header(CONTENT_TYPE, IMAGE_JPEG)
        .header(CONTENT_LENGTH, bytes.len())
        .header(CONTENT_DISPOSITION, format!("{disposition}; filename=\"{}\"", image.filename))
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
