//! Router tests driven through `tower::ServiceExt::oneshot`.
//!
//! Each test assembles a `Gateway` on a `TestClock`, pointing destinations at
//! a wiremock server, and exercises the HTTP surface end to end. Dispatch is
//! detached from the response, so delivery effects are awaited by polling.

use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use herald_api::{create_router, handlers::ErrorResponse, Config, Gateway};
use herald_core::{NoOpEventHandler, TestClock};
use herald_delivery::{config::RetrySettings, CircuitConfig, DeadLetterRecord, DestinationConfig, HttpSender};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

const PAYLOAD: &str = r#"{
    "version": "4",
    "groupKey": "{}:{alertname=\"HighLatency\"}",
    "status": "firing",
    "receiver": "herald",
    "alerts": [
        {"status": "firing", "labels": {"alertname": "HighLatency", "instance": "api-1"}},
        {"status": "firing", "labels": {"alertname": "HighLatency", "instance": "api-2"}}
    ]
}"#;

fn destination(name: &str, url: &str) -> DestinationConfig {
    DestinationConfig {
        retry: RetrySettings { max_attempts: 2, base_delay_ms: 1, max_delay_ms: 10, ..RetrySettings::default() },
        ..DestinationConfig::new(name, url)
    }
}

fn gateway(config: Config) -> Arc<Gateway> {
    Arc::new(
        Gateway::new(
            config,
            Arc::new(TestClock::new()),
            Arc::new(HttpSender::with_defaults().unwrap()),
            Arc::new(NoOpEventHandler::new()),
        )
        .unwrap(),
    )
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.expect("failed to make request");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn health_reports_healthy_with_request_id() {
    let app = create_router(gateway(Config::default()));

    let (status, headers, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-request-id"));
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["circuits"]["open"], 0);
    assert_eq!(body["checks"]["dead_letters"], 0);
}

#[tokio::test]
async fn liveness_and_stats_are_public() {
    let mut config = Config::default();
    config.auth.bearer_tokens = vec!["secret".to_string()];
    let app = create_router(gateway(config));

    let (status, _, body) = send(&app, get("/live")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
    assert_eq!(body["service"], "herald");

    let (status, _, body) = send(&app, get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rate_limiter"]["max_attempts"], 5);
    assert_eq!(body["template_cache"]["max_size"], 100);
}

#[tokio::test]
async fn webhook_fans_out_to_enabled_destinations() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.destinations = vec![
        destination("chat", &format!("{}/chat", server.uri())),
        destination("siem", &format!("{}/siem", server.uri())),
        DestinationConfig { enabled: false, ..destination("paused", &format!("{}/paused", server.uri())) },
    ];
    let app = create_router(gateway(config));

    let (status, _, body) = send(&app, post("/webhook", PAYLOAD)).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["alerts"], 2);
    assert_eq!(body["destinations"], serde_json::json!(["chat", "siem"]));

    let mock = &server;
    eventually(move || async move { mock.received_requests().await.unwrap_or_default().len() == 2 }).await;
    let paths: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|request| request.url.path().to_string())
        .collect();
    assert!(paths.contains(&"/chat".to_string()));
    assert!(paths.contains(&"/siem".to_string()));
}

#[tokio::test]
async fn named_destination_validation() {
    let mut config = Config::default();
    config.destinations = vec![
        destination("chat", "http://127.0.0.1:1/chat"),
        DestinationConfig { enabled: false, ..destination("paused", "http://127.0.0.1:1/paused") },
    ];
    let app = create_router(gateway(config));

    let (status, _, body) = send(&app, post("/webhook/missing", PAYLOAD)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let error: ErrorResponse = serde_json::from_value(body).unwrap();
    assert_eq!(error.error.code, "destination_not_found");

    let (status, _, body) = send(&app, post("/webhook/paused", PAYLOAD)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "destination_disabled");

    let (status, _, body) = send(&app, post("/webhook/chat", "{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_payload");

    let (status, _, body) = send(&app, post("/webhook/chat", r#"{"alerts": []}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_input");
}

#[tokio::test]
async fn exhausted_delivery_surfaces_in_dead_letters() {
    let server = MockServer::start().await;
    Mock::given(matchers::any())
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.destinations = vec![destination("chat", &server.uri())];
    let gateway = gateway(config);
    let app = create_router(gateway.clone());

    let (status, _, _) = send(&app, post("/webhook/chat", PAYLOAD)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let store = gateway.dead_letters().clone();
    eventually(move || {
        let store = store.clone();
        async move { store.size().await == 1 }
    })
    .await;

    let (status, _, body) = send(&app, get("/dead-letters?destination=chat")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    let record = &body["records"][0];
    assert_eq!(record["destination"], "chat");
    assert_eq!(record["attempts"], 2);
    assert_eq!(record["error_history"].as_array().unwrap().len(), 2);

    let (_, _, body) = send(&app, get("/dead-letters?destination=other")).await;
    assert_eq!(body["count"], 0);

    // The failure is also visible through the breaker.
    let (_, _, body) = send(&app, get("/circuits")).await;
    assert_eq!(body[0]["name"], "chat");
    assert_eq!(body[0]["state"], "closed");
}

#[tokio::test]
async fn dead_letter_crud() {
    let gateway = gateway(Config::default());
    let store = gateway.dead_letters();
    let first = store
        .add(DeadLetterRecord::new("chat", serde_json::json!({"text": "a"}), Utc::now()))
        .await
        .unwrap();
    store.add(DeadLetterRecord::new("siem", serde_json::json!({"text": "b"}), Utc::now())).await.unwrap();
    let app = create_router(gateway.clone());

    let (status, _, body) = send(&app, get("/dead-letters")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let (status, _, body) = send(&app, get("/dead-letters/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["by_destination"]["chat"], 1);

    let (status, _, body) = send(&app, get(&format!("/dead-letters/{first}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["payload"]["text"], "a");

    let delete = Request::builder().method("DELETE").uri(format!("/dead-letters/{first}")).body(Body::empty()).unwrap();
    let (status, _, _) = send(&app, delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, body) = send(&app, get(&format!("/dead-letters/{first}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "dead_letter_not_found");

    let clear = Request::builder().method("DELETE").uri("/dead-letters").body(Body::empty()).unwrap();
    let (status, _, body) = send(&app, clear).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], 1);
    assert_eq!(store.size().await, 0);
}

#[tokio::test]
async fn circuit_listing_and_reset() {
    let gateway = gateway(Config::default());
    let config = CircuitConfig { failure_threshold: 1, ..CircuitConfig::default() };
    let breaker = gateway.breakers().get_or_create("chat", &config).unwrap();
    let _ = breaker.execute(|| async { Err::<(), _>("boom") }).await;
    let app = create_router(gateway.clone());

    let (_, _, body) = send(&app, get("/health")).await;
    assert_eq!(body["status"], "degraded");

    let (status, _, body) = send(&app, get("/circuits")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["state"], "open");

    let (status, _, body) = send(&app, post("/circuits/chat/reset", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "closed");
    assert_eq!(body["failure_count"], 0);

    let (status, _, _) = send(&app, post("/circuits/unknown/reset", "")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

mod auth {
    use super::*;

    fn authed_config() -> Config {
        let mut config = Config::default();
        config.auth.bearer_tokens = vec!["s3cret".to_string()];
        config.destinations = vec![destination("chat", "http://127.0.0.1:1/chat")];
        config
    }

    fn webhook(token: Option<&str>, source: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .header("x-forwarded-for", source);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(PAYLOAD)).unwrap()
    }

    #[tokio::test]
    async fn rejects_missing_and_wrong_credentials() {
        let app = create_router(gateway(authed_config()));

        let (status, headers, body) = send(&app, webhook(None, "203.0.113.1")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(headers.contains_key("www-authenticate"));
        assert_eq!(body["error"]["code"], "missing_credentials");

        let (status, _, body) = send(&app, webhook(Some("nope"), "203.0.113.1")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "invalid_credentials");

        let (status, _, _) = send(&app, webhook(Some("s3cret"), "203.0.113.1")).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _, _) = send(&app, get("/dead-letters")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn breaker_reset_requires_credentials() {
        let gateway = gateway(authed_config());
        let config = CircuitConfig { failure_threshold: 1, ..CircuitConfig::default() };
        let breaker = gateway.breakers().get_or_create("chat", &config).unwrap();
        let _ = breaker.execute(|| async { Err::<(), _>("boom") }).await;
        let app = create_router(gateway.clone());

        let (status, _, _) = send(&app, get("/circuits")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(&app, post("/circuits/chat/reset", "")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "missing_credentials");
        assert_eq!(breaker.stats().state, herald_core::CircuitState::Open);

        let reset = Request::builder()
            .method("POST")
            .uri("/circuits/chat/reset")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, reset).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "closed");
    }

    #[tokio::test]
    async fn repeated_failures_ban_the_source() {
        let gateway = gateway(authed_config());
        let app = create_router(gateway.clone());

        for _ in 0..5 {
            let (status, _, _) = send(&app, webhook(Some("wrong"), "198.51.100.9")).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        let (status, _, body) = send(&app, webhook(Some("s3cret"), "198.51.100.9")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "rate_limited");

        let (status, _, _) = send(&app, webhook(Some("s3cret"), "198.51.100.10")).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let stats = gateway.rate_limiter().stats();
        assert_eq!(stats.banned_keys, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let gateway = gateway(authed_config());
        let app = create_router(gateway.clone());

        for _ in 0..4 {
            send(&app, webhook(Some("wrong"), "192.0.2.5")).await;
        }
        let (status, _, _) = send(&app, webhook(Some("s3cret"), "192.0.2.5")).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _, _) = send(&app, webhook(Some("wrong"), "192.0.2.5")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _, _) = send(&app, webhook(Some("s3cret"), "192.0.2.5")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
}
