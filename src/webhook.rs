//! Instagram webhooks: subscription verification and event notifications.
//!
//! Events are only logged and counted, nothing is stored.
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    app_metrics::{CAT_KIND, MET_WEBHOOK_EVENTS},
    http_endpoints::AppState,
};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum SignatureCheck {
    Verified,
    /// App secret is not configured, payload is accepted as is
    Skipped,
}

#[derive(Error, Debug, PartialEq)]
pub enum SignatureError {
    #[error("Missing signature")]
    Missing,
    #[error("Signature is not a hex string")]
    Malformed,
    #[error("Signature mismatch")]
    Mismatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    CommentAdded { media_id: Option<String> },
    CommentRemoved { media_id: Option<String> },
    Comment,
    LiveComment,
    Mention,
    StoryInsights,
    /// `field` is absent when the change doesn't name one
    Unhandled { field: Option<String> },
    DirectMessage,
    Postback,
    MessageRead,
}

impl WebhookEvent {
    fn kind(&self) -> &'static str {
        match self {
            WebhookEvent::CommentAdded { .. } => "comment_added",
            WebhookEvent::CommentRemoved { .. } => "comment_removed",
            WebhookEvent::Comment => "comment",
            WebhookEvent::LiveComment => "live_comment",
            WebhookEvent::Mention => "mention",
            WebhookEvent::StoryInsights => "story_insights",
            WebhookEvent::Unhandled { .. } => "unhandled",
            WebhookEvent::DirectMessage => "direct_message",
            WebhookEvent::Postback => "postback",
            WebhookEvent::MessageRead => "message_read",
        }
    }
}

/// Returns the challenge to echo back when the subscription request is ours.
pub fn verify_subscription(params: &VerifyParams, verify_token: &str) -> Option<String> {
    let subscribing = params.mode.as_deref() == Some("subscribe");
    let token_matches = params.verify_token.as_deref() == Some(verify_token);
    (subscribing && token_matches).then(|| params.challenge.clone().unwrap_or_default())
}

/// Checks `X-Hub-Signature-256`, which is HMAC-SHA256 of the raw body keyed with the app secret.
/// The comparison is constant-time.
pub fn verify_signature(app_secret: Option<&str>, signature: Option<&str>, body: &[u8]) -> Result<SignatureCheck, SignatureError> {
    let Some(secret) = app_secret else {
        return Ok(SignatureCheck::Skipped);
    };
    let signature = signature.ok_or(SignatureError::Missing)?;
    let provided = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    let provided = hex::decode(provided.trim()).map_err(|_| SignatureError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
    mac.update(body);
    mac.verify_slice(&provided).map_err(|_| SignatureError::Mismatch)?;
    Ok(SignatureCheck::Verified)
}

/// Turns every change and messaging item of the payload into an event.
/// Entries and items are inspected one by one, so a malformed sibling
/// doesn't hide the valid ones.
pub fn collect_events(payload: &Value) -> Vec<WebhookEvent> {
    let object = payload.get("object").and_then(Value::as_str).unwrap_or("unknown");
    let mut events = Vec::new();
    for entry in array_field(payload, "entry") {
        debug!("Processing {object} webhook entry {:?} sent at {:?}", entry.get("id"), entry.get("time"));
        for change in array_field(entry, "changes") {
            events.push(change_event(change));
        }
        for messaging in array_field(entry, "messaging") {
            debug!("Messaging event from {:?}", messaging.get("sender"));
            if present(messaging, "message") {
                events.push(WebhookEvent::DirectMessage);
            }
            if present(messaging, "postback") {
                events.push(WebhookEvent::Postback);
            }
            if present(messaging, "read") {
                events.push(WebhookEvent::MessageRead);
            }
        }
    }
    events
}

/// Items of the array `name`, nothing when it's missing or not an array
fn array_field<'a>(value: &'a Value, name: &str) -> &'a [Value] {
    value.get(name).and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default()
}

fn present(value: &Value, name: &str) -> bool {
    value.get(name).is_some_and(|v| !v.is_null())
}

fn change_event(change: &Value) -> WebhookEvent {
    let value = |name: &str| change.get("value").and_then(|v| v.get(name));
    match change.get("field").and_then(Value::as_str) {
        Some("comments") => {
            let media_id = value("object_id").map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            match value("verb").and_then(Value::as_str) {
                Some("add") => WebhookEvent::CommentAdded { media_id },
                Some("remove") => WebhookEvent::CommentRemoved { media_id },
                _ => WebhookEvent::Comment,
            }
        },
        Some("live_comments") => WebhookEvent::LiveComment,
        Some("mentions") => WebhookEvent::Mention,
        Some("story_insights") => WebhookEvent::StoryInsights,
        other => WebhookEvent::Unhandled { field: other.map(str::to_string) },
    }
}

fn log_event(event: &WebhookEvent) {
    match event {
        WebhookEvent::CommentAdded { media_id } => info!("New comment on media {:?}", media_id),
        WebhookEvent::CommentRemoved { media_id } => info!("Comment removed from media {:?}", media_id),
        WebhookEvent::Unhandled { field } => info!("Unhandled webhook field: {field:?}"),
        other => info!("Webhook event: {}", other.kind()),
    }
    metrics::counter!(MET_WEBHOOK_EVENTS, CAT_KIND => event.kind()).increment(1);
}

fn plain_text(status: StatusCode, body: impl Into<String>) -> Response {
    (status, [(CONTENT_TYPE, "text/plain")], body.into()).into_response()
}

/// GET /api/webhook, called by Meta while the webhook is being set up
pub async fn verify(
    Query(params): Query<VerifyParams>,
    State(state): State<AppState>,
) -> Response {
    debug!("Webhook verification request: mode={:?}", params.mode);
    match verify_subscription(&params, &state.settings.webhook.verify_token) {
        Some(challenge) => {
            info!("Webhook verified successfully");
            plain_text(StatusCode::OK, challenge)
        },
        None => {
            warn!("Webhook verification failed: mode={:?}", params.mode);
            plain_text(StatusCode::FORBIDDEN, "Forbidden")
        },
    }
}

/// POST /api/webhook, event notifications
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    match verify_signature(state.settings.instagram.app_secret(), signature, &body) {
        Ok(SignatureCheck::Verified) => debug!("Webhook signature verified"),
        Ok(SignatureCheck::Skipped) => warn!("App secret is not configured, skipping webhook signature verification"),
        Err(SignatureError::Missing) => {
            warn!("Webhook without signature header");
            return plain_text(StatusCode::BAD_REQUEST, "Missing signature");
        },
        Err(err) => {
            warn!("Invalid webhook signature: {err}");
            return plain_text(StatusCode::UNAUTHORIZED, "Unauthorized");
        },
    }

    let json: Value = match serde_json::from_slice(&body) {
        Ok(json) => json,
        Err(err) => {
            warn!("Webhook payload is not JSON: {err}");
            return plain_text(StatusCode::BAD_REQUEST, "Bad Request");
        },
    };
    for event in collect_events(&json) {
        log_event(&event);
    }

    plain_text(StatusCode::OK, "OK")
}

#[cfg(test)]
mod test {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_subscription() {
        let params = VerifyParams {
            mode: Some("subscribe".to_string()),
            verify_token: Some("secret-token".to_string()),
            challenge: Some("1158201444".to_string()),
        };
        assert_eq!(verify_subscription(&params, "secret-token").as_deref(), Some("1158201444"));
        assert_eq!(verify_subscription(&params, "other"), None);

        let params = VerifyParams { mode: Some("unsubscribe".to_string()), ..params };
        assert_eq!(verify_subscription(&params, "secret-token"), None);
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"object":"instagram","entry":[]}"#;
        let signature = sign("app-secret", body);

        assert_eq!(verify_signature(Some("app-secret"), Some(&signature), body), Ok(SignatureCheck::Verified));
        // prefix is optional
        let bare = signature.trim_start_matches("sha256=");
        assert_eq!(verify_signature(Some("app-secret"), Some(bare), body), Ok(SignatureCheck::Verified));

        assert_eq!(verify_signature(Some("other-secret"), Some(&signature), body), Err(SignatureError::Mismatch));
        assert_eq!(verify_signature(Some("app-secret"), Some(&signature), b"tampered"), Err(SignatureError::Mismatch));
        assert_eq!(verify_signature(Some("app-secret"), Some("sha256=zz"), body), Err(SignatureError::Malformed));
        assert_eq!(verify_signature(Some("app-secret"), None, body), Err(SignatureError::Missing));
        assert_eq!(verify_signature(None, None, body), Ok(SignatureCheck::Skipped));
    }

    #[test]
    fn test_collect_events() {
        let payload = serde_json::json!({
            "object": "instagram",
            "entry": [{
                "id": "17841400000000000",
                "time": 1700000000,
                "changes": [
                    {"field": "comments", "value": {"verb": "add", "object_id": "1790000"}},
                    {"field": "comments", "value": {"verb": "remove", "object_id": 42}},
                    {"field": "mentions", "value": {"media_id": "1"}},
                    {"field": "story_insights", "value": {}},
                    {"field": "live_comments", "value": {}},
                    {"field": "follows", "value": {}}
                ],
                "messaging": [
                    {"sender": {"id": "1"}, "message": {"text": "hi"}},
                    {"sender": {"id": "1"}, "postback": {"payload": "HELP"}, "read": {"mid": "m1"}}
                ]
            }]
        });

        assert_eq!(collect_events(&payload), vec![
            WebhookEvent::CommentAdded { media_id: Some("1790000".to_string()) },
            WebhookEvent::CommentRemoved { media_id: Some("42".to_string()) },
            WebhookEvent::Mention,
            WebhookEvent::StoryInsights,
            WebhookEvent::LiveComment,
            WebhookEvent::Unhandled { field: Some("follows".to_string()) },
            WebhookEvent::DirectMessage,
            WebhookEvent::Postback,
            WebhookEvent::MessageRead,
        ]);
    }

    #[test]
    fn test_payload_without_entries() {
        let payload: Value = serde_json::from_str(r#"{"object":"instagram"}"#).unwrap();
        assert!(collect_events(&payload).is_empty());
        assert!(collect_events(&serde_json::json!({"entry": "nope"})).is_empty());
    }

    #[test]
    fn test_malformed_siblings_keep_valid_events() {
        let payload = serde_json::json!({
            "object": "instagram",
            "entry": [
                {"id": "1", "time": "yesterday", "changes": [{"field": "comments", "value": {"verb": "add", "object_id": "7"}}]},
                {"id": "2", "messaging": null, "changes": "oops"},
                "not an entry"
            ]
        });
        assert_eq!(collect_events(&payload), vec![
            WebhookEvent::CommentAdded { media_id: Some("7".to_string()) },
        ]);
    }

    #[test]
    fn test_change_without_field_is_unhandled() {
        let payload = serde_json::json!({
            "entry": [{"changes": [{"field": "mentions"}, {"value": {}}]}]
        });
        assert_eq!(collect_events(&payload), vec![
            WebhookEvent::Mention,
            WebhookEvent::Unhandled { field: None },
        ]);
    }

    mod routes {
        use super::sign;
        use crate::http_endpoints::{router, test_support::state_with_base};
        use axum::{body::Body, http::{Request, StatusCode}};
        use http_body_util::BodyExt;
        use tower::ServiceExt;

        async fn body_text(response: axum::response::Response) -> String {
            let body = response.into_body().collect().await.unwrap().to_bytes();
            String::from_utf8(body.to_vec()).unwrap()
        }

        fn post(body: &'static str, signature: Option<String>) -> Request<Body> {
            let mut builder = Request::builder().method("POST").uri("/api/webhook");
            if let Some(signature) = signature {
                builder = builder.header("x-hub-signature-256", signature);
            }
            builder.body(Body::from(body)).unwrap()
        }

        #[tokio::test]
        async fn test_subscription_handshake() {
            let app = router(state_with_base("http://127.0.0.1:9"));
            let response = app.clone()
                .oneshot(Request::builder()
                    .uri("/api/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=CHALLENGE")
                    .body(Body::empty())
                    .unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, "CHALLENGE");

            let response = app
                .oneshot(Request::builder()
                    .uri("/api/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=CHALLENGE")
                    .body(Body::empty())
                    .unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            assert_eq!(body_text(response).await, "Forbidden");
        }

        #[tokio::test]
        async fn test_signed_notification() {
            let body = r#"{"object":"instagram","entry":[{"id":"1","changes":[{"field":"mentions","value":{}}]}]}"#;
            let app = router(state_with_base("http://127.0.0.1:9"));
            let response = app.oneshot(post(body, Some(sign("app-secret", body.as_bytes())))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, "OK");
        }

        #[tokio::test]
        async fn test_rejected_notifications() {
            let app = router(state_with_base("http://127.0.0.1:9"));

            let response = app.clone().oneshot(post("{}", None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_text(response).await, "Missing signature");

            let response = app.clone().oneshot(post("{}", Some(sign("wrong-secret", b"{}")))).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(body_text(response).await, "Unauthorized");

            let response = app.oneshot(post("not json", Some(sign("app-secret", b"not json")))).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_text(response).await, "Bad Request");
        }
    }
}
