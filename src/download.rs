use bytes::Bytes;
use http::StatusCode;
use thiserror::Error;

use crate::{app_metrics::{CAT_STATUS, MET_DOWNLOADS}, string_util::StrUtil};

/// Placeholder image served instead of real Instagram media
#[derive(Debug, Clone, PartialEq)]
pub struct DemoImage {
    pub id: &'static str,
    /// Relative to the configured demo image host
    pub path: &'static str,
    pub filename: &'static str,
    /// Quality label, matched the same way as the id
    pub size: &'static str,
}

pub static DEMO_IMAGES: [DemoImage; 3] = [
    DemoImage {
        id: "demo_1",
        path: "1080/1080.jpg?random=instasave1",
        filename: "InstaSave_Demo_High_Quality.jpg",
        size: "high",
    },
    DemoImage {
        id: "demo_2",
        path: "720/720.jpg?random=instasave2",
        filename: "InstaSave_Demo_Medium_Quality.jpg",
        size: "medium",
    },
    DemoImage {
        id: "demo_3",
        path: "480/480.jpg?random=instasave3",
        filename: "InstaSave_Demo_Low_Quality.jpg",
        size: "low",
    },
];

/// Represents download error
#[derive(Error, Debug)]
pub enum DlError {
    #[error("File is too large: {0}")]
    FileTooLarge(u64),
    #[error("Download failed")]
    DownloadFailed,
    #[error("Not found")]
    NotFound,
    #[error("Rate limiter exceeded")]
    TooManyRequests,
    /// We probably just need to try again later
    #[error("Server error")]
    ServerError,
}

impl From<reqwest::Error> for DlError {
    fn from(_: reqwest::Error) -> Self {
        DlError::DownloadFailed
    }
}

/// Picks the demo image whose id or quality label is a part of `requested_id`,
/// so that option ids like `ABC123_medium` select the medium image.
pub fn find_demo_image(requested_id: &str) -> Option<&'static DemoImage> {
    DEMO_IMAGES.iter()
        .find(|img| requested_id.contains(img.id) || requested_id.contains(img.size))
}

impl DemoImage {
    pub fn url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_right_slash(), self.path)
    }
}

pub async fn download(client: &reqwest::Client, url: &str, file_max_size: u64) -> std::result::Result<Bytes, DlError> {
    let Ok(resp) = client.get(url).send().await else {
        metrics::counter!(MET_DOWNLOADS, CAT_STATUS => "not_found").increment(1);
        return Err(DlError::NotFound);
    };
    // checked before the generic client error branch, 429 is a 4xx too
    if resp.status() == StatusCode::TOO_MANY_REQUESTS {
        metrics::counter!(MET_DOWNLOADS, CAT_STATUS => "too_many_requests").increment(1);
        return Err(DlError::TooManyRequests);
    }
    if resp.status().is_client_error() {
        metrics::counter!(MET_DOWNLOADS, CAT_STATUS => "not_found").increment(1);
        return Err(DlError::NotFound);
    }
    if resp.status().is_server_error() {
        metrics::counter!(MET_DOWNLOADS, CAT_STATUS => "server_error").increment(1);
        return Err(DlError::ServerError);
    }
    if !resp.status().is_success() {
        metrics::counter!(MET_DOWNLOADS, CAT_STATUS => "other_failed").increment(1);
        return Err(DlError::DownloadFailed);
    }

    if let Some(size) = resp.content_length() {
        if size > file_max_size {
            metrics::counter!(MET_DOWNLOADS, CAT_STATUS => "too_large").increment(1);
            return Err(DlError::FileTooLarge(size));
        }
    }

    let bytes = resp.bytes().await?;
    if bytes.len() as u64 > file_max_size {
        metrics::counter!(MET_DOWNLOADS, CAT_STATUS => "too_large").increment(1);
        return Err(DlError::FileTooLarge(bytes.len() as u64));
    }
    metrics::counter!(MET_DOWNLOADS, CAT_STATUS => "success").increment(1);

    Ok(bytes)
}
