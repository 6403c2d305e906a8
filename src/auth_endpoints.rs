//! Instagram login flow and the endpoints that use the stored user token.
use axum::{
    extract::{Query, State},
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};
use url::form_urlencoded;

use crate::{
    app_metrics::record_oauth,
    http_endpoints::{json_response, AppState},
    instagram_client::{ApiError, LongLivedToken},
    media_type::{ApiResponse, MediaItem},
    pages,
    session::{
        clear_cookie, days_until_expiry, expiry_after, generate_state, read_cookie, set_cookie,
        LONG_LIVED_MAX_AGE, SHORT_LIVED_MAX_AGE, STATE_COOKIE, STATE_MAX_AGE, TOKEN_COOKIE, TOKEN_EXPIRY_COOKIE,
    },
};

/// Tokens expiring later than this are not refreshed
const REFRESH_THRESHOLD_DAYS: f64 = 10.0;

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SuccessParams {
    user_id: Option<String>,
}

fn with_cookies(response: impl IntoResponse, cookies: impl IntoIterator<Item = HeaderValue>) -> Response {
    let mut response = response.into_response();
    for cookie in cookies {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    response
}

/// Redirect back to the home page carrying the query `pairs`
fn ui_redirect(app_url: &str, path: &str, pairs: &[(&str, &str)]) -> Redirect {
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    Redirect::to(&format!("{app_url}{path}?{query}"))
}

fn error_redirect(app_url: &str, error: &str, message: &str) -> Response {
    ui_redirect(app_url, "/", &[("error", error), ("message", message)]).into_response()
}

/// Cookies holding the user token and its expiry time
fn token_cookies(token: &str, max_age: u64, secure: bool) -> [HeaderValue; 2] {
    let expiry = expiry_after(Utc::now(), max_age).to_rfc3339();
    [
        set_cookie(TOKEN_COOKIE, token, max_age, secure),
        set_cookie(TOKEN_EXPIRY_COOKIE, &expiry, max_age, secure),
    ]
}

/// Starts the OAuth flow by sending the browser to the Instagram consent screen.
pub async fn login(State(state): State<AppState>) -> Response {
    let app_url = state.settings.instagram.app_url();
    let csrf_state = generate_state();

    match state.instagram.authorization_url(&csrf_state) {
        Ok(auth_url) => {
            record_oauth("login", "success");
            let cookie = set_cookie(STATE_COOKIE, &csrf_state, STATE_MAX_AGE, state.settings.is_production());
            with_cookies(Redirect::to(&auth_url), [cookie])
        },
        Err(err) => {
            error!("OAuth initiation error: {err}");
            record_oauth("login", "fail");
            error_redirect(&app_url, "oauth_setup_failed", &err.to_string())
        },
    }
}

pub async fn callback(
    Query(params): Query<CallbackParams>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let app_url = state.settings.instagram.app_url();

    if let Some(err) = params.error.as_deref() {
        warn!("Instagram authorization denied: {err}");
        let message = params.error_description.as_deref().unwrap_or("Authorization denied");
        return error_redirect(&app_url, "oauth_denied", message);
    }
    let Some(code) = params.code.as_deref().filter(|c| !c.is_empty()) else {
        return error_redirect(&app_url, "missing_code", "Authorization code not received");
    };
    let stored_state = read_cookie(&headers, STATE_COOKIE);
    if stored_state.is_none() || stored_state != params.state {
        warn!("OAuth state mismatch");
        return error_redirect(&app_url, "invalid_state", "Invalid state parameter - possible CSRF attack");
    }

    let short_lived = match state.instagram.exchange_code(code, &state.settings.instagram.redirect_uri()).await {
        Ok(token) => token,
        Err(err) => return callback_failure(&app_url, err),
    };

    let (token, max_age) = match state.instagram.exchange_long_lived(&short_lived.access_token).await {
        Ok(LongLivedToken { access_token, expires_in, .. }) => (access_token, expires_in.unwrap_or(LONG_LIVED_MAX_AGE)),
        Err(err) => {
            warn!("Long-lived token exchange failed, keeping the short-lived token: {err}");
            (short_lived.access_token, SHORT_LIVED_MAX_AGE)
        },
    };
    info!("Instagram account {} connected", short_lived.user_id);

    let secure = state.settings.is_production();
    let [token_cookie, expiry_cookie] = token_cookies(&token, max_age, secure);
    with_cookies(
        ui_redirect(&app_url, "/auth/success", &[("user_id", &short_lived.user_id)]),
        [clear_cookie(STATE_COOKIE), token_cookie, expiry_cookie],
    )
}

fn callback_failure(app_url: &str, err: ApiError) -> Response {
    error!("OAuth callback error: {err}");
    match err {
        ApiError::OAuth(message) => error_redirect(app_url, "oauth_error", &message),
        _ => error_redirect(app_url, "callback_failed", "Failed to complete authorization"),
    }
}

/// Older callback path, only reports the outcome of the code exchange
pub async fn legacy_callback(
    Query(params): Query<CallbackParams>,
    State(state): State<AppState>,
) -> Response {
    let app_url = state.settings.instagram.app_url();

    if let Some(err) = params.error.as_deref() {
        return ui_redirect(&app_url, "", &[("error", err)]).into_response();
    }
    let Some(code) = params.code.as_deref().filter(|c| !c.is_empty()) else {
        return ui_redirect(&app_url, "", &[("error", "no_code")]).into_response();
    };

    let redirect_uri = format!("{app_url}/api/auth/callback");
    match state.instagram.exchange_code(code, &redirect_uri).await {
        Ok(token) => {
            info!("Legacy callback authenticated user {}", token.user_id);
            ui_redirect(&app_url, "", &[("success", "authenticated")]).into_response()
        },
        Err(err) => {
            error!("Token exchange error: {err}");
            ui_redirect(&app_url, "", &[("error", "token_exchange_failed")]).into_response()
        },
    }
}

pub async fn success_page(Query(params): Query<SuccessParams>) -> Html<String> {
    Html(pages::render_auth_success(params.user_id.as_deref()))
}

/// Refreshes the long-lived token when it expires within ten days.
pub async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = read_cookie(&headers, TOKEN_COOKIE) else {
        return json_response::<()>(StatusCode::UNAUTHORIZED, ApiResponse::fail("No token found", "Please log in again"));
    };

    if let Some(days) = read_cookie(&headers, TOKEN_EXPIRY_COOKIE)
        .and_then(|expiry| days_until_expiry(&expiry, Utc::now()))
    {
        if days > REFRESH_THRESHOLD_DAYS {
            let body = ApiResponse {
                days_until_expiry: Some(days.round() as i64),
                ..ApiResponse::done("Token is still fresh, no refresh needed")
            };
            return json_response(StatusCode::OK, body);
        }
    }

    match state.instagram.refresh_long_lived(&token).await {
        Ok(refreshed) => {
            let expires_in = refreshed.expires_in.unwrap_or(LONG_LIVED_MAX_AGE);
            let body = ApiResponse {
                expires_in: Some(expires_in),
                ..ApiResponse::done("Token refreshed successfully")
            };
            with_cookies(
                json_response(StatusCode::OK, body),
                token_cookies(&refreshed.access_token, expires_in, state.settings.is_production()),
            )
        },
        Err(err) if err.is_oauth() => {
            warn!("Token refresh rejected: {err}");
            let body = ApiResponse {
                requires_reauth: Some(true),
                ..ApiResponse::fail("Token refresh failed", "Please reconnect your Instagram account")
            };
            with_cookies(
                json_response::<()>(StatusCode::UNAUTHORIZED, body),
                [clear_cookie(TOKEN_COOKIE), clear_cookie(TOKEN_EXPIRY_COOKIE)],
            )
        },
        Err(err) => {
            error!("Token refresh error: {err}");
            json_response::<()>(StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::fail("Failed to refresh token", err.to_string()))
        },
    }
}

/// Lists the media of the connected account.
pub async fn user_media(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = read_cookie(&headers, TOKEN_COOKIE) else {
        return json_response::<()>(
            StatusCode::UNAUTHORIZED,
            ApiResponse::fail("Not authenticated", "Please connect your Instagram account first"),
        );
    };

    match state.instagram.user_media(&token).await {
        Ok(items) => {
            let message = format!("Found {} media items", items.len());
            json_response::<Vec<MediaItem>>(StatusCode::OK, ApiResponse::ok(items, message))
        },
        Err(err) if err.is_oauth() => {
            warn!("User token rejected: {err}");
            with_cookies(
                json_response::<()>(
                    StatusCode::UNAUTHORIZED,
                    ApiResponse::fail("Authentication expired", "Please reconnect your Instagram account"),
                ),
                [clear_cookie(TOKEN_COOKIE)],
            )
        },
        Err(err) => {
            error!("User media fetch error: {err}");
            json_response::<()>(StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::fail("Failed to fetch media", err.to_string()))
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::http_endpoints::{router, test_support::{state_for, state_with_base}};
    use crate::configs::test_support::settings_with_base;
    use axum::{body::Body, http::{header::{COOKIE, LOCATION}, Request}};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn location(response: &Response) -> String {
        response.headers()[LOCATION].to_str().unwrap().to_string()
    }

    fn set_cookies(response: &Response) -> Vec<String> {
        response.headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_login_sets_state_cookie() {
        let app = router(state_with_base("https://api.instagram.com"));
        let response = app.oneshot(get("/auth/login", None)).await.unwrap();

        assert!(response.status().is_redirection());
        let target = url::Url::parse(&location(&response)).unwrap();
        let state = target.query_pairs().find(|(k, _)| k == "state").map(|(_, v)| v.into_owned()).unwrap();

        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].starts_with(&format!("instagram_oauth_state={state}; Path=/; Max-Age=600; HttpOnly")));
        assert!(!cookies[0].contains("Secure"));
    }

    #[tokio::test]
    async fn test_login_without_app_id() {
        let mut settings = settings_with_base("https://api.instagram.com");
        settings.instagram.app_id = None;
        let app = router(state_for(settings));
        let response = app.oneshot(get("/auth/login", None)).await.unwrap();

        assert!(location(&response).starts_with("http://localhost:3000/?error=oauth_setup_failed&message="));
        assert!(set_cookies(&response).is_empty());
    }

    #[tokio::test]
    async fn test_callback_rejections() {
        let cases = [
            ("/auth/callback?error=access_denied&error_description=User+denied", None,
             "http://localhost:3000/?error=oauth_denied&message=User+denied"),
            ("/auth/callback?error=access_denied", None,
             "http://localhost:3000/?error=oauth_denied&message=Authorization+denied"),
            ("/auth/callback?state=abc", None,
             "http://localhost:3000/?error=missing_code&message=Authorization+code+not+received"),
            ("/auth/callback?code=c&state=abc", None,
             "http://localhost:3000/?error=invalid_state&message=Invalid+state+parameter+-+possible+CSRF+attack"),
            ("/auth/callback?code=c&state=abc", Some("instagram_oauth_state=other"),
             "http://localhost:3000/?error=invalid_state&message=Invalid+state+parameter+-+possible+CSRF+attack"),
        ];
        for (uri, cookie, expected) in cases {
            let app = router(state_with_base("http://127.0.0.1:9"));
            let response = app.oneshot(get(uri, cookie)).await.unwrap();
            assert_eq!(location(&response), expected, "uri: {uri}");
        }
    }

    #[tokio::test]
    async fn test_callback_stores_long_lived_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "short", "user_id": 42
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "long", "token_type": "bearer", "expires_in": 5183944
            })))
            .mount(&server)
            .await;

        let app = router(state_with_base(&server.uri()));
        let response = app
            .oneshot(get("/auth/callback?code=c&state=abc", Some("instagram_oauth_state=abc")))
            .await
            .unwrap();

        assert_eq!(location(&response), "http://localhost:3000/auth/success?user_id=42");
        let cookies = set_cookies(&response);
        assert!(cookies[0].starts_with("instagram_oauth_state=; Path=/; Max-Age=0"));
        assert!(cookies[1].starts_with("instagram_demo_token=long; Path=/; Max-Age=5183944"));
        assert!(cookies[2].starts_with("instagram_token_expiry="));
    }

    #[tokio::test]
    async fn test_callback_keeps_short_lived_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "short", "user_id": "42"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/access_token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let app = router(state_with_base(&server.uri()));
        let response = app
            .oneshot(get("/auth/callback?code=c&state=abc", Some("instagram_oauth_state=abc")))
            .await
            .unwrap();

        assert_eq!(location(&response), "http://localhost:3000/auth/success?user_id=42");
        assert!(set_cookies(&response)[1].starts_with("instagram_demo_token=short; Path=/; Max-Age=3600"));
    }

    #[tokio::test]
    async fn test_callback_oauth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/access_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error_type": "OAuthException", "code": 400, "error_message": "Code expired"
            })))
            .mount(&server)
            .await;

        let app = router(state_with_base(&server.uri()));
        let response = app
            .oneshot(get("/auth/callback?code=c&state=abc", Some("instagram_oauth_state=abc")))
            .await
            .unwrap();
        assert_eq!(location(&response), "http://localhost:3000/?error=oauth_error&message=Code+expired");
    }

    #[tokio::test]
    async fn test_legacy_callback() {
        let app = router(state_with_base("http://127.0.0.1:9"));
        let response = app.clone().oneshot(get("/api/auth/callback", None)).await.unwrap();
        assert_eq!(location(&response), "http://localhost:3000?error=no_code");

        let response = app.clone().oneshot(get("/api/auth/callback?error=access_denied", None)).await.unwrap();
        assert_eq!(location(&response), "http://localhost:3000?error=access_denied");

        // nothing listens on the API address
        let response = app.oneshot(get("/api/auth/callback?code=c", None)).await.unwrap();
        assert_eq!(location(&response), "http://localhost:3000?error=token_exchange_failed");
    }

    #[tokio::test]
    async fn test_refresh_without_token() {
        let app = router(state_with_base("http://127.0.0.1:9"));
        let response = app.oneshot(post("/api/auth/refresh", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"], "No token found");
        assert_eq!(json["message"], "Please log in again");
    }

    #[tokio::test]
    async fn test_refresh_skips_fresh_token() {
        let expiry = expiry_after(Utc::now(), 30 * 86_400 + 60).to_rfc3339();
        let cookie = format!("instagram_demo_token=long; instagram_token_expiry={expiry}");
        let app = router(state_with_base("http://127.0.0.1:9"));
        let response = app.oneshot(post("/api/auth/refresh", Some(&cookie))).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(set_cookies(&response).is_empty());
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "Token is still fresh, no refresh needed");
        assert_eq!(json["daysUntilExpiry"], 30);
    }

    #[tokio::test]
    async fn test_refresh_expiring_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/refresh_access_token"))
            .and(query_param("access_token", "long"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "renewed", "token_type": "bearer"
            })))
            .mount(&server)
            .await;

        let expiry = expiry_after(Utc::now(), 2 * 86_400).to_rfc3339();
        let cookie = format!("instagram_demo_token=long; instagram_token_expiry={expiry}");
        let app = router(state_with_base(&server.uri()));
        let response = app.oneshot(post("/api/auth/refresh", Some(&cookie))).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookies = set_cookies(&response);
        assert!(cookies[0].starts_with("instagram_demo_token=renewed; Path=/; Max-Age=5184000"));
        assert!(cookies[1].starts_with("instagram_token_expiry="));
        let json = body_json(response).await;
        assert_eq!(json["message"], "Token refreshed successfully");
        assert_eq!(json["expiresIn"], 5184000);
    }

    #[tokio::test]
    async fn test_refresh_rejected_requires_reauth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/refresh_access_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "Session has expired", "type": "OAuthException", "code": 190}
            })))
            .mount(&server)
            .await;

        let app = router(state_with_base(&server.uri()));
        let response = app.oneshot(post("/api/auth/refresh", Some("instagram_demo_token=old"))).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().all(|c| c.contains("Max-Age=0")));
        let json = body_json(response).await;
        assert_eq!(json["error"], "Token refresh failed");
        assert_eq!(json["requiresReauth"], true);
    }

    #[tokio::test]
    async fn test_user_media() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/media"))
            .and(query_param("access_token", "good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "1", "media_type": "IMAGE", "media_url": "https://cdn.example/1.jpg"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/me/media"))
            .and(query_param("access_token", "expired"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "Session has expired", "type": "OAuthException", "code": 190}
            })))
            .mount(&server)
            .await;

        let app = router(state_with_base(&server.uri()));

        let response = app.clone().oneshot(get("/api/user-media", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "Not authenticated");

        let response = app.clone().oneshot(get("/api/user-media", Some("instagram_demo_token=good"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["message"], "Found 1 media items");
        assert_eq!(json["data"][0]["downloadUrls"][0]["id"], "1_original");

        let response = app.oneshot(get("/api/user-media", Some("instagram_demo_token=expired"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(set_cookies(&response)[0].starts_with("instagram_demo_token=; Path=/; Max-Age=0"));
        assert_eq!(body_json(response).await["error"], "Authentication expired");
    }
}
