//! Cookie based session of a connected Instagram account.
//!
//! There is no server side storage: the OAuth state, the access token and its
//! expiry time live in `HttpOnly` cookies of the browser.
use chrono::{DateTime, Utc};
use http::{header::COOKIE, HeaderMap, HeaderValue};
use rand::{distributions::Alphanumeric, Rng};
use tracing::warn;

pub const STATE_COOKIE: &str = "instagram_oauth_state";
pub const TOKEN_COOKIE: &str = "instagram_demo_token";
pub const TOKEN_EXPIRY_COOKIE: &str = "instagram_token_expiry";

/// Seconds the user has to finish the consent screen
pub const STATE_MAX_AGE: u64 = 600;
/// Lifetime of a short-lived token
pub const SHORT_LIVED_MAX_AGE: u64 = 3600;
/// 60 days, used when Instagram doesn't report `expires_in`
pub const LONG_LIVED_MAX_AGE: u64 = 5_184_000;

const STATE_LEN: usize = 32;

pub fn generate_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(STATE_LEN)
        .map(char::from)
        .collect()
}

/// Value of the cookie `name` from the `Cookie` request headers
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// `Set-Cookie` value of an `HttpOnly`, `SameSite=Lax` cookie
pub fn set_cookie(name: &str, value: &str, max_age: u64, secure: bool) -> HeaderValue {
    let mut cookie = format!("{name}={value}; Path=/; Max-Age={max_age}; HttpOnly; SameSite=Lax");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| {
        warn!("Cookie {name} has a value that is not a valid header, clearing it instead");
        clear_cookie(name)
    })
}

pub fn clear_cookie(name: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("{name}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax"))
        .unwrap_or_else(|_| HeaderValue::from_static("invalid=; Max-Age=0"))
}

pub fn expiry_after(now: DateTime<Utc>, expires_in: u64) -> DateTime<Utc> {
    now + chrono::Duration::seconds(expires_in as i64)
}

/// Parses the expiry cookie and returns fractional days left, negative when expired
pub fn days_until_expiry(expiry: &str, now: DateTime<Utc>) -> Option<f64> {
    let expiry = DateTime::parse_from_rfc3339(expiry).ok()?.with_timezone(&Utc);
    Some((expiry - now).num_seconds() as f64 / 86_400.0)
}
