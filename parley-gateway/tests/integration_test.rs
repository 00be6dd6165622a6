//! Integration tests for Parley Gateway.
//!
//! Drives the full router, including the rate limiter, against a mock
//! upstream served by wiremock.

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use parley_common::config::{AuthConfig, Config, RateLimitConfig, RetryConfig, UpstreamConfig};
use parley_gateway::{
    build_router, routes::ErrorResponse, AppState, ApproximateCounter, HttpUpstream,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PASSWORD: &str = "secret";

fn test_config(upstream: &str, rate_limit: RateLimitConfig) -> Config {
    Config {
        auth: AuthConfig {
            password: Some(PASSWORD.into()),
        },
        upstream: UpstreamConfig {
            endpoint: format!("{upstream}/v1/chat/completions"),
            api_key: Some("sk-test".into()),
            timeout_secs: 5,
        },
        retry: RetryConfig {
            max_attempts: 3,
            backoff_secs: 0,
        },
        rate_limit,
        ..Default::default()
    }
}

fn unthrottled() -> RateLimitConfig {
    RateLimitConfig {
        general_ms: 0,
        debug_ms: 0,
        api_ms: 0,
        ..Default::default()
    }
}

fn create_test_app(config: &Config) -> Router {
    let client = Arc::new(HttpUpstream::from_config(&config.upstream).unwrap());
    build_router(AppState::new(config, client, Arc::new(ApproximateCounter)))
}

/// App whose upstream is never reachable; for tests that don't call it.
fn offline_app() -> Router {
    create_test_app(&test_config("http://127.0.0.1:1", unthrottled()))
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Option<String>, Value) {
    send(app, Request::builder().method(Method::GET).uri(uri).body(Body::empty()).unwrap()).await
}

async fn post_form(app: &Router, uri: &str, form: &str) -> (StatusCode, Option<String>, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form.to_string()))
        .unwrap();
    send(app, request).await
}

/// Returns status, redirect location, and JSON body (Null when empty).
async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let location = response
        .headers()
        .get(header::LOCATION)
        .map(|v| v.to_str().unwrap().to_string());
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, location, json)
}

fn reply(content: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Landing & Health
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_check() {
    let app = offline_app();
    let (status, _, body) = get(&app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "parley-gateway");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_wrong_password_looks_like_landing() {
    let app = offline_app();
    let (_, _, landing) = get(&app, "/").await;

    let (status, location, body) =
        post_form(&app, "/wrong/chat/message", "content=Hello").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(location, None);
    assert_eq!(body, landing);

    for uri in ["/wrong/chat", "/wrong/chat/debug", "/wrong/chat/clear", "/wrong/chat/pop/top/1"] {
        let (status, _, body) = get(&app, uri).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(body, landing, "{uri}");
    }

    // Nothing was created behind the gate.
    let (_, _, debug) = get(&app, "/secret/chat/debug").await;
    assert_eq!(debug["found"], false);
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversation Flow
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_message_without_reply() {
    let app = offline_app();

    let (status, location, _) = post_form(
        &app,
        "/secret/chat/message",
        "content=Hello%20there&role=user&model=gpt-4&temperature=0.7",
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location.as_deref(), Some("/secret/chat"));

    let (status, _, view) = get(&app, "/secret/chat").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["found"], true);
    assert_eq!(view["last_model"], "gpt-4");
    assert_eq!(view["messages"], json!([{"role": "user", "content": "Hello there"}]));
}

#[tokio::test]
async fn test_message_with_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply("General Kenobi")))
        .expect(1)
        .mount(&server)
        .await;
    let app = create_test_app(&test_config(&server.uri(), unthrottled()));

    let (status, location, _) = post_form(
        &app,
        "/secret/chat/message",
        "content=Hello%20there&expect-response=on",
    )
    .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location.as_deref(), Some("/secret/chat"));

    let (_, _, view) = get(&app, "/secret/chat").await;
    assert_eq!(
        view["messages"],
        json!([
            {"role": "assistant", "content": "General Kenobi"},
            {"role": "user", "content": "Hello there"},
        ])
    );

    let (_, _, debug) = get(&app, "/secret/chat/debug").await;
    assert_eq!(debug["found"], true);
    assert_eq!(debug["total_messages"], 2);
    assert_eq!(debug["user_messages"], 1);
    assert_eq!(debug["assistant_messages"], 1);
    assert_eq!(debug["error_messages"], 0);
    assert_eq!(debug["last_model"], "gpt-3.5-turbo");
    assert_eq!(debug["last_api_request_attempts"], 1);
    assert_eq!(debug["last_api_response"]["status"], 200);
    assert_eq!(
        debug["last_api_request"]["messages"],
        json!([{"role": "user", "content": "Hello there"}])
    );
    assert!(debug["approximate_size"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_throttled_upstream_records_one_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .expect(3)
        .mount(&server)
        .await;
    let app = create_test_app(&test_config(&server.uri(), unthrottled()));

    let (status, _, _) =
        post_form(&app, "/secret/chat/message", "content=Hi&expect-response=on").await;
    assert_eq!(status, StatusCode::SEE_OTHER);

    let (_, _, debug) = get(&app, "/secret/chat/debug").await;
    assert_eq!(debug["last_api_request_attempts"], 3);
    assert_eq!(debug["error_messages"], 1);
    assert_eq!(debug["assistant_messages"], 0);
    assert_eq!(debug["last_api_response"]["status"], 429);
}

#[tokio::test]
async fn test_unreachable_upstream_still_redirects() {
    let app = offline_app();

    let (status, location, _) =
        post_form(&app, "/secret/chat/message", "content=Hi&expect-response=on").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location.as_deref(), Some("/secret/chat"));

    let (_, _, view) = get(&app, "/secret/chat").await;
    assert_eq!(view["messages"][0]["role"], "error");
    assert_eq!(view["messages"][1]["content"], "Hi");
}

#[tokio::test]
async fn test_invalid_message_is_not_stored() {
    let app = offline_app();

    for form in [
        "content=",
        "content=%20%20",
        "content=Hi&temperature=5",
        "content=Hi&temperature=hot",
        "content=Hi&role=error",
    ] {
        let (status, location, _) = post_form(&app, "/secret/chat/message", form).await;
        assert_eq!(status, StatusCode::SEE_OTHER, "{form}");
        assert_eq!(location.as_deref(), Some("/secret/chat"), "{form}");
    }

    let (_, _, debug) = get(&app, "/secret/chat/debug").await;
    assert_eq!(debug, json!({"conversation": "chat", "found": false}));
}

#[tokio::test]
async fn test_pop_messages() {
    let app = offline_app();
    for content in ["a", "b", "c", "d"] {
        post_form(&app, "/secret/chat/message", &format!("content={content}")).await;
    }

    let (status, location, _) = get(&app, "/secret/chat/pop/bottom/1").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location.as_deref(), Some("/secret/chat"));

    get(&app, "/secret/chat/pop/top/1").await;
    let (_, _, view) = get(&app, "/secret/chat").await;
    let contents: Vec<&str> = view["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["c", "b"]);

    // Bad side or count redirects without touching anything.
    for uri in ["/secret/chat/pop/middle/1", "/secret/chat/pop/top/many", "/secret/chat/pop/top/-1"] {
        let (status, _, _) = get(&app, uri).await;
        assert_eq!(status, StatusCode::SEE_OTHER, "{uri}");
    }
    let (_, _, debug) = get(&app, "/secret/chat/debug").await;
    assert_eq!(debug["total_messages"], 2);

    // Popping past the end empties the conversation and zeroes its tokens.
    get(&app, "/secret/chat/pop/top/10").await;
    let (_, _, debug) = get(&app, "/secret/chat/debug").await;
    assert_eq!(debug["total_messages"], 0);
    assert_eq!(debug["token_count"], 0);
    assert_eq!(debug["last_token_count"], 0);
}

#[tokio::test]
async fn test_clear_conversation() {
    let app = offline_app();
    post_form(&app, "/secret/chat/message", "content=Hello").await;

    let (status, location, _) = get(&app, "/secret/chat/clear").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location.as_deref(), Some("/secret/chat"));

    let (_, _, view) = get(&app, "/secret/chat").await;
    assert_eq!(view["found"], false);
    assert_eq!(view["messages"], json!([]));

    // Clearing again is harmless.
    let (status, _, _) = get(&app, "/secret/chat/clear").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn test_control_characters_in_name_redirect_encoded() {
    let app = offline_app();

    let (status, location, _) = post_form(&app, "/secret/a%0Ab/message", "content=Hello").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location.as_deref(), Some("/secret/a%0Ab"));

    let (_, _, view) = get(&app, "/secret/a%0Ab").await;
    assert_eq!(view["conversation"], "a\nb");
    assert_eq!(view["found"], true);

    let (status, location, _) = get(&app, "/secret/a%0Ab/pop/top/1").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location.as_deref(), Some("/secret/a%0Ab"));

    let (status, location, _) = get(&app, "/secret/a%0Ab/clear").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location.as_deref(), Some("/secret/a%0Ab"));

    let (status, location, _) = get(&app, "/secret/my%20chat%2Fold/clear").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(location.as_deref(), Some("/secret/my%20chat%2Fold"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Rate Limiting
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rate_limit_rejects_rapid_requests() {
    let app = create_test_app(&test_config("http://127.0.0.1:1", RateLimitConfig::default()));

    let (status, _, _) = get(&app, "/").await;
    assert_eq!(status, StatusCode::OK);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.error, "Slow down! You're sending too many requests!");
    assert_eq!(error.code, "rate_limited");

    // A different class is tracked separately.
    let (status, _, _) = get(&app, "/secret/chat/debug").await;
    assert_eq!(status, StatusCode::OK);

    // So is a different client behind the local proxy.
    let forwarded = Request::builder()
        .uri("/")
        .header("x-forwarded-for", "203.0.113.5")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, forwarded).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limited_message_is_not_stored() {
    let app = create_test_app(&test_config("http://127.0.0.1:1", RateLimitConfig::default()));

    let (status, _, _) = post_form(&app, "/secret/chat/message", "content=first").await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    let (status, _, _) = post_form(&app, "/secret/chat/message", "content=second").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let (_, _, view) = get(&app, "/secret/chat").await;
    assert_eq!(view["messages"], json!([{"role": "user", "content": "first"}]));
}
