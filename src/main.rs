use std::{collections::BTreeMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_UPSTREAM_API_URL: &str = "https://www.tikwm.com/api/";
const DEFAULT_UPSTREAM_ORIGIN: &str = "https://tikwm.com";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_PROXY_FILENAME: &str = "tiktok-video.mp4";
const RESOLVE_TIMEOUT_SECONDS: u64 = 60;
const CONNECT_TIMEOUT_SECONDS: u64 = 10;

#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    http_client: reqwest::Client,
}

#[derive(Debug, Clone)]
struct AppConfig {
    bind_addr: String,
    upstream_api_url: String,
    upstream_origin: String,
    resolve_timeout: Duration,
}

impl AppConfig {
    fn from_env() -> Self {
        let upstream_api_url = read_env("UPSTREAM_API_URL")
            .map(ensure_trailing_slash)
            .unwrap_or_else(|| DEFAULT_UPSTREAM_API_URL.to_string());
        let upstream_origin = read_env("UPSTREAM_ORIGIN")
            .map(|origin| origin.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_UPSTREAM_ORIGIN.to_string());

        Self {
            bind_addr: resolve_bind_addr(),
            upstream_api_url,
            upstream_origin,
            resolve_timeout: Duration::from_secs(RESOLVE_TIMEOUT_SECONDS),
        }
    }
}

/// Priority order for watermark-free variants is the declaration order;
/// the ordered quality map and the default selection rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum QualityKey {
    Nwmplay,
    Hdplay,
    Play,
}

const QUALITY_PRIORITY: [QualityKey; 3] =
    [QualityKey::Nwmplay, QualityKey::Hdplay, QualityKey::Play];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum QualityTier {
    Standard,
    Hd,
}

impl QualityKey {
    fn label(self) -> &'static str {
        match self {
            QualityKey::Nwmplay => "No watermark (standard quality)",
            QualityKey::Hdplay => "HD quality (no watermark)",
            QualityKey::Play => "Standard quality (no watermark)",
        }
    }

    fn tier(self) -> QualityTier {
        match self {
            QualityKey::Hdplay => QualityTier::Hd,
            QualityKey::Nwmplay | QualityKey::Play => QualityTier::Standard,
        }
    }

    fn raw_url(self, data: &UpstreamData) -> Option<&str> {
        match self {
            QualityKey::Nwmplay => data.nwmplay.as_deref(),
            QualityKey::Hdplay => data.hdplay.as_deref(),
            QualityKey::Play => data.play.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct QualityOption {
    url: String,
    label: String,
    quality: QualityTier,
}

#[derive(Debug)]
struct ResolvedMedia {
    qualities: BTreeMap<QualityKey, QualityOption>,
    default_quality: QualityKey,
    default_url: String,
    title: Option<String>,
    author: Option<serde_json::Value>,
    cover: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    download_url: String,
    proxy_download_url: String,
    default_quality: QualityKey,
    qualities: BTreeMap<QualityKey, QualityOption>,
    title: String,
    author: serde_json::Value,
    cover: String,
}

#[derive(Debug, Deserialize)]
struct ProxyQuery {
    #[serde(rename = "videoUrl", default)]
    video_url: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Mp3Response {
    video_url: String,
    title: String,
    author: serde_json::Value,
    message: String,
}

#[derive(Debug, Deserialize)]
struct StoryRequest {
    #[serde(default)]
    username: String,
}

#[derive(Debug, Serialize)]
struct StoryResponse {
    stories: serde_json::Value,
    username: String,
}

#[derive(Debug, Serialize)]
struct PhotoResponse {
    images: Vec<String>,
    title: String,
    author: serde_json::Value,
    cover: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
    details: Option<String>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
            details: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
            details: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: Some("NOT_FOUND"),
            details: None,
        }
    }

    fn upstream(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: Some("UPSTREAM_ERROR"),
            details,
        }
    }

    fn network(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: Some("NETWORK_ERROR"),
            details,
        }
    }

    fn upstream_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: Some("UPSTREAM_ERROR"),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            details: self.details,
        });

        (self.status, body).into_response()
    }
}

/// Upstream resolver envelope: a zero `code` means success and `data`
/// carries the payload; `msg` carries the failure detail otherwise.
#[derive(Debug, Deserialize)]
struct UpstreamEnvelope<T> {
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UpstreamData {
    title: Option<String>,
    author: Option<serde_json::Value>,
    cover: Option<String>,
    nwmplay: Option<String>,
    hdplay: Option<String>,
    play: Option<String>,
    images: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy)]
enum ResolveMode {
    Video,
    Audio,
    Photo,
}

impl ResolveMode {
    fn extra_form_fields(self) -> &'static [(&'static str, &'static str)] {
        match self {
            ResolveMode::Video => &[("count", "12"), ("cursor", "0"), ("web", "1"), ("hd", "1")],
            ResolveMode::Audio => &[("web", "1"), ("hd", "1")],
            ResolveMode::Photo => &[("web", "1")],
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();
    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS))
        .build()
        .map_err(|error| ApiError::internal(format!("Could not build the HTTP client: {error}")))?;

    info!(
        "Upstream resolver at {} (media origin {})",
        config.upstream_api_url, config.upstream_origin
    );

    let state = AppState {
        config: Arc::new(config),
        http_client,
    };
    let bind_addr = state.config.bind_addr.clone();

    let app = build_router(state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {bind_addr}: {error}")))?;

    info!("Backend listening at http://{bind_addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/download", post(download))
        .route("/proxy-video", get(proxy_video))
        .route("/download-mp3", post(download_mp3))
        .route("/download-story", post(download_story))
        .route("/download-photo", post(download_photo))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION])
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "message": "backend is running" }))
}

async fn download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("URL is required"));
    }
    if !is_tiktok_url(url) {
        return Err(ApiError::bad_request(
            "Unsupported URL. Use a TikTok video URL.",
        ));
    }

    info!("Download request received for URL {url:?}");

    let data = fetch_upstream_data(&state, url, ResolveMode::Video)
        .await?
        .ok_or_else(|| ApiError::not_found("No video URL found in the upstream response."))?;
    let resolved = resolve_media(&data, &state.config.upstream_origin)?;

    let title = resolved
        .title
        .clone()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "TikTok Video".to_string());
    let filename_base = resolved
        .title
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("tiktok-video");
    // The filename query value carries one extra level of encoding; the
    // proxy decodes it once to recover the display name.
    let filename = format!("{}.mp4", urlencoding::encode(filename_base));
    let proxy_download_url = format!(
        "/proxy-video?videoUrl={}&filename={}",
        urlencoding::encode(&resolved.default_url),
        urlencoding::encode(&filename)
    );

    Ok(Json(DownloadResponse {
        download_url: resolved.default_url,
        proxy_download_url,
        default_quality: resolved.default_quality,
        qualities: resolved.qualities,
        title,
        author: resolved
            .author
            .unwrap_or_else(|| serde_json::Value::String(String::new())),
        cover: resolved.cover.unwrap_or_default(),
    }))
}

async fn proxy_video(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
) -> Result<Response, ApiError> {
    let video_url = query.video_url.as_deref().map(str::trim).unwrap_or_default();
    if video_url.is_empty() {
        return Err(ApiError::bad_request("Video URL is required."));
    }
    if !is_absolute_http_url(video_url) {
        return Err(ApiError::bad_request(
            "Video URL must be an absolute http(s) URL.",
        ));
    }

    let filename = query
        .filename
        .as_deref()
        .and_then(|raw| urlencoding::decode(raw).ok())
        .map(|decoded| decoded.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_PROXY_FILENAME.to_string());

    debug!("Proxying media request for {video_url:?} as {filename:?}");

    let upstream = state
        .http_client
        .get(video_url)
        .send()
        .await
        .map_err(|error| {
            warn!("Media fetch failed for {video_url:?}: {error}");
            ApiError::network(
                "Could not fetch the requested media from upstream.",
                Some(error.to_string()),
            )
        })?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    if !status.is_success() {
        warn!("Upstream returned status {status} for {video_url:?}");
        return Err(ApiError::upstream_status(
            status,
            "Failed to fetch the requested media.",
        ));
    }

    let mut headers = HeaderMap::new();
    if let Some(content_type) = upstream.headers().get("content-type")
        && let Ok(value) = HeaderValue::from_bytes(content_type.as_bytes())
    {
        headers.insert(CONTENT_TYPE, value);
    }

    let content_disposition = build_content_disposition(&filename);
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition)
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    // Forward-only relay: dropping the response body (client disconnect)
    // aborts the upstream fetch.
    let mut response = (headers, Body::from_stream(upstream.bytes_stream())).into_response();
    *response.status_mut() = status;
    Ok(response)
}

async fn download_mp3(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<Mp3Response>, ApiError> {
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("URL is required"));
    }
    if !is_tiktok_url(url) {
        return Err(ApiError::bad_request(
            "Unsupported URL. Use a TikTok video URL.",
        ));
    }

    let data = fetch_upstream_data(&state, url, ResolveMode::Audio)
        .await?
        .ok_or_else(|| ApiError::not_found("No video was found for this URL."))?;

    let origin = &state.config.upstream_origin;
    let video_url = QUALITY_PRIORITY
        .iter()
        .filter_map(|key| key.raw_url(&data))
        .map(str::trim)
        .find(|raw| !raw.is_empty())
        .map(|raw| normalize_media_url(raw, origin))
        .ok_or_else(|| ApiError::not_found("No video was found for this URL."))?;

    Ok(Json(Mp3Response {
        video_url,
        title: data
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "TikTok Audio".to_string()),
        author: data
            .author
            .unwrap_or_else(|| serde_json::Value::String(String::new())),
        message: "Video URL resolved. Use it for client-side MP3 conversion.".to_string(),
    }))
}

async fn download_story(
    State(state): State<AppState>,
    Json(payload): Json<StoryRequest>,
) -> Result<Json<StoryResponse>, ApiError> {
    let username = clean_username(&payload.username);
    if username.is_empty() {
        return Err(ApiError::bad_request("Username is required"));
    }

    info!("Story request received for user {username:?}");

    let stories = fetch_user_stories(&state, username)
        .await?
        .filter(|value| !value.is_null())
        .filter(|value| value.as_array().is_none_or(|items| !items.is_empty()))
        .ok_or_else(|| {
            ApiError::not_found("No stories found or the user has no active stories.")
        })?;

    Ok(Json(StoryResponse {
        stories,
        username: username.to_string(),
    }))
}

async fn download_photo(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<PhotoResponse>, ApiError> {
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("URL is required"));
    }
    if !is_tiktok_url(url) {
        return Err(ApiError::bad_request(
            "Unsupported URL. Use a TikTok post URL.",
        ));
    }

    let data = fetch_upstream_data(&state, url, ResolveMode::Photo)
        .await?
        .ok_or_else(|| ApiError::not_found("No photos were found for this URL."))?;

    let origin = &state.config.upstream_origin;
    let images: Vec<String> = data
        .images
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|image| normalize_media_url(image, origin))
        .collect();

    if images.is_empty() {
        return Err(ApiError::not_found("No photos were found for this URL."));
    }

    Ok(Json(PhotoResponse {
        images,
        title: data
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "TikTok Photos".to_string()),
        author: data
            .author
            .unwrap_or_else(|| serde_json::Value::String(String::new())),
        cover: data
            .cover
            .as_deref()
            .map(|cover| normalize_media_url(cover, origin))
            .unwrap_or_default(),
    }))
}

async fn fetch_upstream_data(
    state: &AppState,
    url: &str,
    mode: ResolveMode,
) -> Result<Option<UpstreamData>, ApiError> {
    let mut form: Vec<(&str, &str)> = vec![("url", url)];
    form.extend_from_slice(mode.extra_form_fields());

    debug!(
        "Resolving {url:?} against upstream {}",
        state.config.upstream_api_url
    );

    let response = state
        .http_client
        .post(&state.config.upstream_api_url)
        .form(&form)
        .timeout(state.config.resolve_timeout)
        .send()
        .await
        .map_err(resolver_transport_error)?;

    let envelope = response
        .json::<UpstreamEnvelope<UpstreamData>>()
        .await
        .map_err(|error| {
            ApiError::network(
                "The upstream resolver returned an unreadable response.",
                Some(error.to_string()),
            )
        })?;

    unwrap_envelope(envelope)
}

async fn fetch_user_stories(
    state: &AppState,
    username: &str,
) -> Result<Option<serde_json::Value>, ApiError> {
    let endpoint = format!("{}user/story", state.config.upstream_api_url);

    let response = state
        .http_client
        .get(&endpoint)
        .query(&[("unique_id", username)])
        .timeout(state.config.resolve_timeout)
        .send()
        .await
        .map_err(resolver_transport_error)?;

    let envelope = response
        .json::<UpstreamEnvelope<serde_json::Value>>()
        .await
        .map_err(|error| {
            ApiError::network(
                "The upstream resolver returned an unreadable response.",
                Some(error.to_string()),
            )
        })?;

    unwrap_envelope(envelope)
}

fn unwrap_envelope<T>(envelope: UpstreamEnvelope<T>) -> Result<Option<T>, ApiError> {
    if envelope.code == Some(0) {
        Ok(envelope.data)
    } else {
        let details = envelope.msg.unwrap_or_else(|| "Unknown error".to_string());
        warn!(
            "Upstream resolver returned code {:?}: {details}",
            envelope.code
        );
        Err(ApiError::upstream(
            "The upstream resolver reported an error.",
            Some(details),
        ))
    }
}

fn resolver_transport_error(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::network("The resolver request timed out.", None)
    } else {
        ApiError::network(
            "Could not reach the upstream resolver.",
            Some(error.to_string()),
        )
    }
}

fn resolve_media(data: &UpstreamData, origin: &str) -> Result<ResolvedMedia, ApiError> {
    let qualities = collect_quality_options(data, origin);
    let (default_quality, default_url) = qualities
        .iter()
        .next()
        .map(|(key, option)| (*key, option.url.clone()))
        .ok_or_else(|| ApiError::not_found("No video URL found in the upstream response."))?;

    Ok(ResolvedMedia {
        qualities,
        default_quality,
        default_url,
        title: data.title.clone(),
        author: data.author.clone(),
        cover: data
            .cover
            .as_deref()
            .map(|cover| normalize_media_url(cover, origin)),
    })
}

fn collect_quality_options(
    data: &UpstreamData,
    origin: &str,
) -> BTreeMap<QualityKey, QualityOption> {
    let mut options = BTreeMap::new();

    for key in QUALITY_PRIORITY {
        let Some(raw) = key.raw_url(data) else {
            continue;
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }

        options.insert(
            key,
            QualityOption {
                url: normalize_media_url(trimmed, origin),
                label: key.label().to_string(),
                quality: key.tier(),
            },
        );
    }

    options
}

/// Upstream URLs arrive absolute, protocol-relative or root-relative; only
/// absolute HTTPS URLs may leave the resolver.
fn normalize_media_url(raw: &str, origin: &str) -> String {
    if let Some(rest) = raw.strip_prefix("//") {
        format!("https://{rest}")
    } else if raw.starts_with('/') {
        format!("{origin}{raw}")
    } else {
        raw.to_string()
    }
}

fn is_tiktok_url(input: &str) -> bool {
    let parsed = match Url::parse(input) {
        Ok(url) => url,
        Err(_) => return false,
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    let host = match parsed.host_str() {
        Some(host) => host.to_ascii_lowercase(),
        None => return false,
    };

    const TIKTOK_DOMAINS: [&str; 3] = ["tiktok.com", "vm.tiktok.com", "vt.tiktok.com"];

    TIKTOK_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

fn is_absolute_http_url(input: &str) -> bool {
    Url::parse(input).is_ok_and(|parsed| {
        matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
    })
}

fn clean_username(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed.strip_prefix('@').unwrap_or(trimmed).trim()
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        DEFAULT_PROXY_FILENAME.to_string()
    } else {
        compact.to_string()
    }
}

fn ensure_trailing_slash(mut value: String) -> String {
    if !value.ends_with('/') {
        value.push('/');
    }
    value
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
