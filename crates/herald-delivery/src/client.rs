//! Outbound HTTP sender.
//!
//! `Sender` is the seam the dispatcher sends through; `HttpSender` is the
//! reqwest-backed implementation. Non-2xx responses come back as
//! `ClientError`/`ServerError` so the retrier can classify them.

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::HeaderMap, Method, Response};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Largest response body kept, in bytes.
pub const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Settings for the shared HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// User agent string.
    pub user_agent: String,
    /// Maximum redirects followed.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("herald/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
        }
    }
}

/// One outbound attempt.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Destination name.
    pub destination: String,
    /// Target URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Extra headers configured on the destination.
    pub headers: BTreeMap<String, String>,
    /// Encoded body.
    pub body: Bytes,
    /// Body content type.
    pub content_type: String,
    /// Unit index within the dispatch.
    pub unit_index: usize,
    /// Attempt number (1-based).
    pub attempt: u32,
}

/// Successful (2xx) response.
#[derive(Debug, Clone)]
pub struct SendResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, truncated to `MAX_RESPONSE_BODY_SIZE`.
    pub body: String,
    /// Request round-trip time.
    pub duration: Duration,
}

/// Issues outbound requests.
#[async_trait]
pub trait Sender: Send + Sync + std::fmt::Debug {
    /// Sends one request.
    ///
    /// # Errors
    ///
    /// Transport failures map to `NetworkError`/`Timeout`; non-2xx responses
    /// map to `ClientError`/`ServerError`.
    async fn send(&self, request: SendRequest) -> Result<SendResponse>;
}

/// `Sender` backed by a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpSender {
    /// Builds the underlying client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if reqwest rejects the
    /// settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Client with default settings.
    ///
    /// # Errors
    ///
    /// See [`HttpSender::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    fn map_transport_error(&self, error: &reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            let timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
            return DeliveryError::timeout(timeout_ms);
        }
        if error.is_connect() {
            return DeliveryError::network(format!("connection failed: {}", error_chain(error)));
        }
        DeliveryError::network(error_chain(error))
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, request: SendRequest) -> Result<SendResponse> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes()).map_err(|_| {
            DeliveryError::configuration(format!("invalid HTTP method '{}'", request.method))
        })?;

        let span = info_span!(
            "alert_delivery",
            destination = %request.destination,
            url = %request.url,
            unit_index = request.unit_index,
            attempt = request.attempt
        );

        async move {
            let start = Instant::now();
            let mut http_request = self
                .client
                .request(method, &request.url)
                .header("content-type", &request.content_type)
                .body(request.body.clone());

            for (name, value) in &request.headers {
                if !is_managed_header(name) {
                    http_request = http_request.header(name, value);
                }
            }

            http_request = http_request
                .header("X-Herald-Destination", &request.destination)
                .header("X-Herald-Unit", request.unit_index.to_string())
                .header("X-Herald-Attempt", request.attempt.to_string());

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(duration_ms = start.elapsed().as_millis() as u64, error = %e, "request failed");
                    return Err(self.map_transport_error(&e));
                },
            };

            let response = read_response(response, start).await;
            tracing::debug!(
                status = response.status_code,
                duration_ms = response.duration.as_millis() as u64,
                "received response"
            );

            if (200..300).contains(&response.status_code) {
                Ok(response)
            } else {
                tracing::warn!(status = response.status_code, "destination returned error status");
                Err(DeliveryError::from_status(response.status_code, response.body))
            }
        }
        .instrument(span)
        .await
    }
}

async fn read_response(response: Response, start: Instant) -> SendResponse {
    let status_code = response.status().as_u16();
    let headers = extract_headers(response.headers());

    let body = match response.bytes().await {
        Ok(bytes) => truncate_body(&bytes),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read response body");
            format!("[failed to read response body: {e}]")
        },
    };

    SendResponse { status_code, headers, body, duration: start.elapsed() }
}

fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() > MAX_RESPONSE_BODY_SIZE {
        let kept = String::from_utf8_lossy(&bytes[..MAX_RESPONSE_BODY_SIZE]);
        format!("{kept}{TRUNCATION_SUFFIX}")
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect()
}

/// reqwest hides the interesting part (DNS, refused) in the source chain.
fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Hop-by-hop and transport headers the client controls.
fn is_managed_header(header_name: &str) -> bool {
    matches!(
        header_name.to_lowercase().as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request(url: String) -> SendRequest {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer abc".to_string());
        headers.insert("Host".to_string(), "spoofed".to_string());

        SendRequest {
            destination: "chat".to_string(),
            url,
            method: "post".to_string(),
            headers,
            body: Bytes::from_static(br#"{"text":"hi"}"#),
            content_type: "application/json".to_string(),
            unit_index: 4,
            attempt: 2,
        }
    }

    #[tokio::test]
    async fn successful_send_carries_metadata_headers() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::header("X-Herald-Destination", "chat"))
            .and(matchers::header("X-Herald-Unit", "4"))
            .and(matchers::header("X-Herald-Attempt", "2"))
            .and(matchers::header("Authorization", "Bearer abc"))
            .and(matchers::header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let sender = HttpSender::with_defaults().unwrap();
        let response = sender.send(request(format!("{}/hook", server.uri()))).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "ok");
    }

    #[tokio::test]
    async fn server_error_maps_to_server_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let sender = HttpSender::with_defaults().unwrap();
        let err = sender.send(request(server.uri())).await.unwrap_err();

        assert_eq!(err, DeliveryError::server_error(503, "overloaded"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn client_error_maps_to_client_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(422).set_body_string("bad payload"))
            .mount(&server)
            .await;

        let sender = HttpSender::with_defaults().unwrap();
        let err = sender.send(request(server.uri())).await.unwrap_err();

        assert_eq!(err, DeliveryError::client_error(422, "bad payload"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn slow_destination_times_out() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let config = ClientConfig { timeout: Duration::from_millis(50), ..ClientConfig::default() };
        let sender = HttpSender::new(config).unwrap();
        let err = sender.send(request(server.uri())).await.unwrap_err();

        assert_eq!(err, DeliveryError::timeout(50));
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sender = HttpSender::with_defaults().unwrap();
        let err = sender.send(request(format!("http://{addr}/hook"))).await.unwrap_err();

        assert!(matches!(err, DeliveryError::NetworkError { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn invalid_method_is_configuration_error() {
        let sender = HttpSender::with_defaults().unwrap();
        let mut bad = request("http://127.0.0.1:1/".to_string());
        bad.method = "NOT A METHOD".to_string();

        let err = sender.send(bad).await.unwrap_err();
        assert!(matches!(err, DeliveryError::ConfigurationError { .. }));
    }

    #[test]
    fn oversized_body_is_truncated() {
        let body = vec![b'x'; MAX_RESPONSE_BODY_SIZE + 10];
        let truncated = truncate_body(&body);

        assert_eq!(truncated.len(), MAX_RESPONSE_BODY_SIZE + TRUNCATION_SUFFIX.len());
        assert!(truncated.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(truncate_body(b"short"), "short");
    }

    #[test]
    fn managed_headers_identified() {
        assert!(is_managed_header("Content-Length"));
        assert!(is_managed_header("HOST"));
        assert!(!is_managed_header("Authorization"));
        assert!(!is_managed_header("X-Custom"));
    }
}
