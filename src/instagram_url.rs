use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use url::Url;

const INSTAGRAM_HOSTS: [&str; 4] = [
    "instagram.com",
    "www.instagram.com",
    "m.instagram.com",
    "web.instagram.com",
];
const CANONICAL_HOST: &str = "www.instagram.com";

/// Path prefixes of single media pages, in the order they are looked up
const MEDIA_PREFIXES: [&str; 3] = ["p", "reel", "tv"];

#[derive(Error, Debug, PartialEq)]
pub enum UrlError {
    #[error("URL is required")]
    Missing,
    #[error("Invalid Instagram URL. Please provide a valid Instagram post, reel, or story URL.")]
    NotInstagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Post,
    Reel,
    Story,
    Profile,
    Unknown,
}

/// Checks that `url` points to instagram and to a page we know how to handle:
/// a post, reel, IGTV video, story or a profile.
/// Media and story paths are matched by prefix, anything may follow the id.
pub fn is_valid_instagram_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    if !INSTAGRAM_HOSTS.contains(&host.as_str()) {
        return false;
    }

    content_path_patterns().iter().any(|re| re.is_match(parsed.path()))
}

fn content_path_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^/p/[A-Za-z0-9_-]+/?",
            r"^/reel/[A-Za-z0-9_-]+/?",
            r"^/tv/[A-Za-z0-9_-]+/?",
            r"^/stories/[A-Za-z0-9_.-]+/[0-9]+/?",
            r"^/[A-Za-z0-9_.-]+/?$",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern).unwrap_or_else(|e| panic!("invalid pattern {pattern}: {e}")))
        .collect()
    })
}

/// Returns `url` without query and fragment and with the canonical host.
/// Unparseable input is returned as is.
pub fn normalize_instagram_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    parsed.set_query(None);
    parsed.set_fragment(None);
    if parsed.set_host(Some(CANONICAL_HOST)).is_err() {
        return url.to_string();
    }
    parsed.to_string()
}

pub fn content_type(url: &str) -> ContentType {
    let Ok(parsed) = Url::parse(url) else {
        return ContentType::Unknown;
    };
    let path = parsed.path();
    if path.starts_with("/p/") {
        return ContentType::Post;
    }
    // IGTV is served as reels now
    if path.starts_with("/reel/") || path.starts_with("/tv/") {
        return ContentType::Reel;
    }
    if path.starts_with("/stories/") {
        return ContentType::Story;
    }
    match path_segments(path).as_slice() {
        [name] if is_username(name) => ContentType::Profile,
        _ => ContentType::Unknown,
    }
}

/// Extracts the post shortcode from a post, reel or IGTV URL.
pub fn extract_shortcode(url: &str) -> Option<String> {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    };
    for prefix in MEDIA_PREFIXES {
        let needle = format!("/{prefix}/");
        if let Some(pos) = path.find(&needle) {
            let id: String = path[pos + needle.len() ..]
                .chars()
                .take_while(|c| is_media_id_char(*c))
                .collect();
            if !id.is_empty() {
                return Some(id);
            }
        }
    }
    None
}

fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn is_media_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_username(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| is_media_id_char(c) || c == '.')
}
