use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::{
    app_metrics::record_oauth,
    configs::InstagramCfg,
    media_type::{DownloadOption, MediaItem, MediaKind, MediaMetadata, Quality},
    string_util::safe_filename,
};

const FILENAME_PREFIX: &str = "instasave";

const USER_AGENT: &str = "InstaSave/1.0";
const USER_MEDIA_FIELDS: &str = "id,caption,media_type,media_url,permalink,thumbnail_url,timestamp";
const OAUTH_EXCEPTION: &str = "OAuthException";

/// Failure of a call to Instagram or Facebook Graph API
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Instagram API is not configured: {0}")]
    NotConfigured(&'static str),
    /// Token or authorization code was rejected, user has to log in again
    #[error("OAuth error: {0}")]
    OAuth(String),
    #[error("Instagram API rate limit exceeded{}", .retry_after.map(|s| format!(", retry after {s} seconds")).unwrap_or_default())]
    RateLimited { retry_after: Option<u64> },
    #[error("Content not found")]
    NotFound,
    #[error("Access denied: {0}")]
    Forbidden(String),
    /// We probably just need to try again later
    #[error("Instagram server error ({0})")]
    Server(u16),
    #[error("Instagram API error ({status}): {message}")]
    Status { status: u16, message: String },
    #[error("Request failed: {0}")]
    Transport(String),
    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

impl ApiError {
    pub fn is_oauth(&self) -> bool {
        matches!(self, ApiError::OAuth(_))
    }
}

/// Token returned for an authorization code, valid for about an hour
#[derive(Debug, Clone, Deserialize)]
pub struct ShortLivedToken {
    pub access_token: String,
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
}

/// Token valid for 60 days which can be refreshed while it's still valid
#[derive(Debug, Clone, Deserialize)]
pub struct LongLivedToken {
    pub access_token: String,
    pub token_type: Option<String>,
    /// Seconds
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OEmbed {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub html: Option<String>,
    pub thumbnail_url: Option<String>,
    pub thumbnail_width: Option<u32>,
    pub thumbnail_height: Option<u32>,
    pub author_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserMediaPage {
    #[serde(default)]
    data: Vec<UserMediaEntry>,
}

#[derive(Debug, Deserialize)]
struct UserMediaEntry {
    id: String,
    caption: Option<String>,
    media_type: Option<String>,
    media_url: Option<String>,
    permalink: Option<String>,
    thumbnail_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AppToken {
    access_token: String,
}

/// Interface for Instagram Graph API and Basic Display API calls
#[async_trait]
pub trait InstagramApi {

    /// URL of the Instagram consent screen the user is redirected to.
    /// ## Arguments:
    /// * `state` - opaque CSRF token that Instagram sends back to the callback
    fn authorization_url(&self, state: &str) -> Result<String, ApiError>;

    /// Exchanges authorization code for a short-lived user token.
    /// `redirect_uri` must be the same as in the authorization request.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<ShortLivedToken, ApiError>;

    /// Exchanges short-lived user token for a long-lived one
    async fn exchange_long_lived(&self, short_lived_token: &str) -> Result<LongLivedToken, ApiError>;

    /// Extends the lifetime of a long-lived token that is not expired yet
    async fn refresh_long_lived(&self, token: &str) -> Result<LongLivedToken, ApiError>;

    /// Media of the user owning the token
    async fn user_media(&self, token: &str) -> Result<Vec<MediaItem>, ApiError>;

    /// App token used for the oEmbed endpoint
    async fn app_access_token(&self) -> Result<String, ApiError>;

    async fn oembed(&self, url: &str, app_token: &str, max_width: u32) -> Result<OEmbed, ApiError>;
}

pub struct GraphApiClient {
    http: reqwest::Client,
    cfg: InstagramCfg,
}

impl GraphApiClient {
    pub fn new(cfg: &InstagramCfg, timeout: Duration) -> Result<GraphApiClient, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(GraphApiClient { http, cfg: cfg.clone() })
    }

    fn credentials(&self) -> Result<(&str, &str), ApiError> {
        let app_id = self.cfg.app_id.as_deref().filter(|s| !s.is_empty())
            .ok_or(ApiError::NotConfigured("app id is missing"))?;
        let app_secret = self.cfg.app_secret()
            .ok_or(ApiError::NotConfigured("app secret is missing"))?;
        Ok((app_id, app_secret))
    }

    fn graph_url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.graph_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl InstagramApi for GraphApiClient {
    fn authorization_url(&self, state: &str) -> Result<String, ApiError> {
        let app_id = self.cfg.app_id.as_deref().filter(|s| !s.is_empty())
            .ok_or(ApiError::NotConfigured("app id is missing"))?;

        let mut url = Url::parse(&self.cfg.oauth_url)
            .map_err(|_| ApiError::NotConfigured("oauth url is invalid"))?;
        url.query_pairs_mut()
            .append_pair("client_id", app_id)
            .append_pair("redirect_uri", &self.cfg.redirect_uri())
            .append_pair("scope", &self.cfg.scopes.join(","))
            .append_pair("response_type", "code");
        if !state.is_empty() {
            url.query_pairs_mut().append_pair("state", state);
        }
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<ShortLivedToken, ApiError> {
        let (app_id, app_secret) = self.credentials()?;
        let resp = self.http.post(&self.cfg.token_url)
            .form(&[
                ("client_id", app_id),
                ("client_secret", app_secret),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
                ("code", code),
            ])
            .send()
            .await?;

        let token = parse_json::<ShortLivedToken>(resp, true).await;
        record_oauth("code_exchange", if token.is_ok() { "success" } else { "fail" });
        token
    }

    async fn exchange_long_lived(&self, short_lived_token: &str) -> Result<LongLivedToken, ApiError> {
        let (_, app_secret) = self.credentials()?;
        let resp = self.http.get(self.graph_url("access_token"))
            .query(&[
                ("grant_type", "ig_exchange_token"),
                ("client_secret", app_secret),
                ("access_token", short_lived_token),
            ])
            .send()
            .await?;

        let token = parse_json::<LongLivedToken>(resp, true).await;
        if let Ok(long_lived) = &token {
            debug!("Long-lived token issued: type={:?}, expires_in={:?}", long_lived.token_type, long_lived.expires_in);
        }
        record_oauth("long_lived_exchange", if token.is_ok() { "success" } else { "fail" });
        token
    }

    async fn refresh_long_lived(&self, token: &str) -> Result<LongLivedToken, ApiError> {
        let resp = self.http.get(self.graph_url("refresh_access_token"))
            .query(&[
                ("grant_type", "ig_refresh_token"),
                ("access_token", token),
            ])
            .send()
            .await?;

        let token = parse_json::<LongLivedToken>(resp, true).await;
        record_oauth("refresh", if token.is_ok() { "success" } else { "fail" });
        token
    }

    async fn user_media(&self, token: &str) -> Result<Vec<MediaItem>, ApiError> {
        let resp = self.http.get(self.graph_url("me/media"))
            .query(&[
                ("fields", USER_MEDIA_FIELDS),
                ("access_token", token),
            ])
            .send()
            .await?;

        let page = parse_json::<UserMediaPage>(resp, false).await?;
        debug!("Fetched {} user media items", page.data.len());
        Ok(page.data.into_iter().map(user_media_to_item).collect())
    }

    async fn app_access_token(&self) -> Result<String, ApiError> {
        let (app_id, app_secret) = self.credentials()?;
        let url = format!("{}/oauth/access_token", self.cfg.graph_api_url.trim_end_matches('/'));
        let resp = self.http.post(url)
            .form(&[
                ("client_id", app_id),
                ("client_secret", app_secret),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        Ok(parse_json::<AppToken>(resp, true).await?.access_token)
    }

    async fn oembed(&self, url: &str, app_token: &str, max_width: u32) -> Result<OEmbed, ApiError> {
        let endpoint = format!(
            "{}/{}/instagram_oembed",
            self.cfg.graph_api_url.trim_end_matches('/'),
            self.cfg.graph_api_version
        );
        let max_width = max_width.to_string();
        let resp = self.http.get(endpoint)
            .query(&[
                ("url", url),
                ("access_token", app_token),
                ("maxwidth", max_width.as_str()),
                ("omitscript", "true"),
            ])
            .send()
            .await?;

        parse_json::<OEmbed>(resp, false).await
    }
}

/// Own media has exactly one rendition: the original file.
fn user_media_to_item(entry: UserMediaEntry) -> MediaItem {
    let kind = match entry.media_type.as_deref() {
        Some("VIDEO") => MediaKind::Video,
        Some("CAROUSEL_ALBUM") => MediaKind::Carousel,
        _ => MediaKind::Image,
    };
    let option_kind = MediaKind::from_video_flag(kind == MediaKind::Video);
    let permalink = entry.permalink.unwrap_or_default();
    let media_url = entry.media_url.unwrap_or_default();
    let extension = format!(".{}", option_kind.format());
    let filename = safe_filename(&permalink, &extension, FILENAME_PREFIX, chrono::Utc::now().timestamp_millis());

    MediaItem {
        id: entry.id.clone(),
        kind,
        url: permalink.clone(),
        thumbnail: entry.thumbnail_url.or_else(|| Some(media_url.clone()).filter(|u| !u.is_empty())),
        caption: entry.caption,
        username: None,
        display_url: Some(permalink),
        download_urls: vec![DownloadOption {
            id: format!("{}_original", entry.id),
            kind: option_kind,
            quality: Quality::Original,
            url: media_url,
            width: None,
            height: None,
            file_size: None,
            format: Some(option_kind.format().to_string()),
            label: format!("Original {}", option_kind.label()),
            filename: Some(filename),
        }],
        metadata: Some(MediaMetadata::default()),
    }
}

/// Decodes successful response or maps the failed one to [`ApiError`].
/// `token_endpoint` makes every 4xx rejection an OAuth error.
async fn parse_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response, token_endpoint: bool) -> Result<T, ApiError> {
    let status = resp.status();
    if status.is_success() {
        let body = resp.bytes().await?;
        return serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()));
    }

    let retry_after = resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = resp.text().await.unwrap_or_default();
    let err = classify_error(status, &body, retry_after, token_endpoint);
    warn!("Instagram API call failed: {err}");
    Err(err)
}

fn classify_error(status: StatusCode, body: &str, retry_after: Option<u64>, token_endpoint: bool) -> ApiError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ApiError::RateLimited { retry_after };
    }
    if status.is_server_error() {
        return ApiError::Server(status.as_u16());
    }

    let (message, error_type) = error_details(body);
    let message = message.unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown error").to_string());
    let is_oauth_type = error_type.as_deref() == Some(OAUTH_EXCEPTION);

    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            if is_oauth_type || token_endpoint => ApiError::OAuth(message),
        StatusCode::FORBIDDEN => ApiError::Forbidden(message),
        StatusCode::NOT_FOUND => ApiError::NotFound,
        _ => ApiError::Status { status: status.as_u16(), message },
    }
}

/// Instagram uses two error formats:
/// `{"error_type": "...", "error_message": "..."}` on api.instagram.com and
/// `{"error": {"type": "...", "message": "..."}}` on the graph hosts.
/// OAuth errors may also come as `{"error": "...", "error_description": "..."}`.
fn error_details(body: &str) -> (Option<String>, Option<String>) {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return (Some(body.trim().to_string()).filter(|s| !s.is_empty()), None);
    };
    let str_field = |v: &serde_json::Value, name: &str| v.get(name).and_then(|f| f.as_str()).map(|s| s.to_string());

    match json.get("error") {
        Some(obj @ serde_json::Value::Object(_)) =>
            (str_field(obj, "message"), str_field(obj, "type")),
        Some(serde_json::Value::String(code)) =>
            (str_field(&json, "error_description").or_else(|| Some(code.clone())), None),
        _ =>
            (str_field(&json, "error_message"), str_field(&json, "error_type")),
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("unexpected user_id: {other}"))),
    }
}
