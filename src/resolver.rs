use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    app_metrics::{CAT_STATUS, MET_RESOLVES},
    instagram_client::{ApiError, InstagramApi, OEmbed},
    instagram_url::{content_type, extract_shortcode, ContentType},
    media_type::{DownloadOption, MediaItem, MediaKind, MediaMetadata, Quality},
};

const BASE_SIZE: u32 = 1080;
const THUMBNAIL_SIZE: u32 = 400;
const OEMBED_MAX_WIDTH: u32 = 1080;
const FALLBACK_SIZE: u32 = 640;
const DEMO_VIDEO_DURATION: u32 = 30;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Invalid Instagram URL - cannot extract shortcode")]
    InvalidUrl,
    #[error("Instagram API credentials not configured. Please set the app id and app secret.")]
    NotConfigured,
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Content not found or not accessible")]
    NotFound,
    #[error("This content is private and requires authentication")]
    Private,
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("Unable to fetch Instagram content: {0}")]
    Other(String),
}

impl From<ApiError> for ResolveError {
    fn from(err: ApiError) -> Self {
        use ApiError as E;
        match err {
            E::NotConfigured(_) => ResolveError::NotConfigured,
            E::RateLimited { .. } => ResolveError::RateLimited,
            E::NotFound => ResolveError::NotFound,
            E::Forbidden(_) => ResolveError::Private,
            E::OAuth(message) => ResolveError::Api { status: 401, message },
            E::Server(status) => ResolveError::Api { status: 502, message: format!("Instagram server error ({status})") },
            E::Status { status, message } => ResolveError::Api { status, message },
            E::Transport(msg) | E::Decode(msg) => ResolveError::Other(msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub include_metadata: bool,
    pub include_thumbnails: bool,
    /// Best rendition to offer
    pub max_quality: Quality,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        ResolverOptions { include_metadata: true, include_thumbnails: true, max_quality: Quality::Original }
    }
}

/// Turns a normalized Instagram URL into downloadable renditions
#[async_trait]
pub trait MediaResolver {
    async fn resolve(&self, url: &str, opts: &ResolverOptions) -> Result<MediaItem, ResolveError>;

    /// Whether the content behind `url` is public
    async fn validate_access(&self, url: &str) -> bool;
}

/// Always answers with placeholder images, never calls Instagram.
pub struct DemoResolver;

#[async_trait]
impl MediaResolver for DemoResolver {
    async fn resolve(&self, url: &str, opts: &ResolverOptions) -> Result<MediaItem, ResolveError> {
        let result = extract_shortcode(url)
            .map(|shortcode| demo_media(url, &shortcode, opts))
            .ok_or(ResolveError::InvalidUrl);
        record_resolve(&result);
        result
    }

    async fn validate_access(&self, _url: &str) -> bool {
        true
    }
}

fn demo_media(url: &str, shortcode: &str, opts: &ResolverOptions) -> MediaItem {
    let is_video = content_type(url) == ContentType::Reel;
    let kind = MediaKind::from_video_flag(is_video);

    // (quality, percent of the base size, video bytes, image bytes)
    let renditions = [
        (Quality::High, 100, 5_242_880, 524_288),
        (Quality::Medium, 67, 2_621_440, 262_144),
        (Quality::Low, 44, 1_048_576, 131_072),
    ];
    let download_urls: Vec<DownloadOption> = renditions.iter()
        // low quality is offered whatever the limit is
        .filter(|(quality, ..)| *quality <= opts.max_quality || *quality == Quality::Low)
        .map(|&(quality, percent, video_size, image_size)| {
            let side = BASE_SIZE * percent / 100;
            DownloadOption {
                id: format!("{shortcode}_{}", quality.as_str()),
                kind,
                quality,
                url: format!("https://picsum.photos/{side}/{side}?random={shortcode}"),
                width: Some(side),
                height: Some(side),
                file_size: Some(if is_video { video_size } else { image_size }),
                format: Some(kind.format().to_string()),
                label: format!("{} Quality {} ({side}x{side})", quality.label(), kind.label()),
                filename: None,
            }
        })
        .collect();

    let metadata = MediaMetadata {
        width: Some(BASE_SIZE),
        height: Some(BASE_SIZE),
        duration: is_video.then_some(DEMO_VIDEO_DURATION),
        file_size: download_urls.first().and_then(|o| o.file_size).or(Some(524_288)),
    };

    MediaItem {
        id: shortcode.to_string(),
        kind,
        url: url.to_string(),
        thumbnail: opts.include_thumbnails
            .then(|| format!("https://picsum.photos/{THUMBNAIL_SIZE}/{THUMBNAIL_SIZE}?random={shortcode}")),
        caption: Some(format!(
            "Demo content for {shortcode}. This is a demo version of InstaSave. In production, real Instagram content would be displayed here."
        )),
        username: Some("demo_user".to_string()),
        display_url: Some(url.to_string()),
        download_urls,
        metadata: opts.include_metadata.then_some(metadata),
    }
}

/// Resolves public posts through the official oEmbed endpoint.
pub struct OEmbedResolver {
    api: Arc<dyn InstagramApi + Send + Sync + 'static>,
    has_credentials: bool,
}

impl OEmbedResolver {
    pub fn new(api: Arc<dyn InstagramApi + Send + Sync + 'static>, has_credentials: bool) -> OEmbedResolver {
        OEmbedResolver { api, has_credentials }
    }

    async fn fetch(&self, url: &str, opts: &ResolverOptions) -> Result<MediaItem, ResolveError> {
        if !self.has_credentials {
            return Err(ResolveError::NotConfigured);
        }
        let app_token = self.api.app_access_token().await?;
        let oembed = self.api.oembed(url, &app_token, OEMBED_MAX_WIDTH).await?;
        debug!("oEmbed response for {url}: type={:?}", oembed.kind);
        Ok(parse_oembed(oembed, url, opts))
    }
}

#[async_trait]
impl MediaResolver for OEmbedResolver {
    async fn resolve(&self, url: &str, opts: &ResolverOptions) -> Result<MediaItem, ResolveError> {
        let result = self.fetch(url, opts).await;
        if let Err(err) = &result {
            error!("Failed to fetch Instagram content: {err}");
        }
        record_resolve(&result);
        result
    }

    async fn validate_access(&self, _url: &str) -> bool {
        // private content is reported by the oEmbed call itself
        true
    }
}

fn parse_oembed(oembed: OEmbed, url: &str, opts: &ResolverOptions) -> MediaItem {
    let shortcode = extract_shortcode(url);
    let is_video = oembed.kind.as_deref() == Some("video");
    let kind = MediaKind::from_video_flag(is_video);
    let html = oembed.html.as_deref().unwrap_or_default();

    let code = shortcode.clone().unwrap_or_else(|| "unknown".to_string());
    let media_urls = media_urls_from_html(html);
    let download_urls = if media_urls.is_empty() {
        vec![DownloadOption {
            id: format!("{code}_fallback"),
            kind,
            quality: Quality::Medium,
            url: "#".to_string(),
            width: Some(FALLBACK_SIZE),
            height: Some(FALLBACK_SIZE),
            file_size: None,
            format: Some(kind.format().to_string()),
            label: format!("{} - Standard Quality", kind.label()),
            filename: None,
        }]
    } else {
        media_urls.into_iter().enumerate()
            .map(|(i, media_url)| DownloadOption {
                id: format!("{code}_option_{i}"),
                kind,
                quality: Quality::High,
                url: media_url,
                width: Some(BASE_SIZE),
                height: Some(BASE_SIZE),
                file_size: None,
                format: Some(kind.format().to_string()),
                label: format!("{} - High Quality", kind.label()),
                filename: None,
            })
            .collect()
    };

    MediaItem {
        id: shortcode.unwrap_or_else(|| chrono::Utc::now().timestamp_millis().to_string()),
        kind,
        url: url.to_string(),
        thumbnail: oembed.thumbnail_url.filter(|_| opts.include_thumbnails),
        caption: caption_from_html(html),
        username: oembed.author_name.map(|name| name.replace('@', "")),
        display_url: Some(url.to_string()),
        download_urls,
        metadata: opts.include_metadata.then(|| MediaMetadata {
            width: Some(oembed.thumbnail_width.unwrap_or(BASE_SIZE)),
            height: Some(oembed.thumbnail_height.unwrap_or(BASE_SIZE)),
            duration: None,
            file_size: None,
        }),
    }
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap_or_else(|e| panic!("invalid pattern {pattern}: {e}")))
}

/// Image sources first, then video sources
fn media_urls_from_html(html: &str) -> Vec<String> {
    static IMAGE_SRC: OnceLock<Regex> = OnceLock::new();
    static VIDEO_SRC: OnceLock<Regex> = OnceLock::new();
    let image = regex(&IMAGE_SRC, r#"(?i)src="([^"]*\.(?:jpg|jpeg|png|webp)[^"]*)""#);
    let video = regex(&VIDEO_SRC, r#"(?i)src="([^"]*\.(?:mp4|webm|mov)[^"]*)""#);

    image.captures_iter(html)
        .chain(video.captures_iter(html))
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// First non-empty paragraph, `alt` or `title` text with markup removed
fn caption_from_html(html: &str) -> Option<String> {
    static PARAGRAPH: OnceLock<Regex> = OnceLock::new();
    static ALT: OnceLock<Regex> = OnceLock::new();
    static TITLE: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();
    let patterns = [
        regex(&PARAGRAPH, r"(?i)<p[^>]*>(.*?)</p>"),
        regex(&ALT, r#"(?i)alt="([^"]*?)""#),
        regex(&TITLE, r#"(?i)title="([^"]*?)""#),
    ];
    let tag = regex(&TAG, r"<[^>]*>");

    patterns.iter()
        .filter_map(|re| re.captures(html).and_then(|c| c.get(1)))
        .map(|m| m.as_str())
        .find(|s| !s.trim().is_empty())
        .map(|s| tag.replace_all(s, "").trim().to_string())
}

fn record_resolve(result: &Result<MediaItem, ResolveError>) {
    let status = match result {
        Ok(_) => "success",
        Err(ResolveError::InvalidUrl) => "invalid_url",
        Err(ResolveError::NotConfigured) => "not_configured",
        Err(ResolveError::RateLimited) => "too_many_requests",
        Err(ResolveError::NotFound) => "not_found",
        Err(ResolveError::Private) => "private",
        Err(ResolveError::Api { .. }) => "api_error",
        Err(ResolveError::Other(_)) => "other_failed",
    };
    metrics::counter!(MET_RESOLVES, CAT_STATUS => status).increment(1);
}
