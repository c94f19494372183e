use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use enginebench_core::{BackendConfig, EngineError, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 500;

/// Shared HTTP plumbing for the adapters: auth, custom headers, timeouts,
/// status mapping and retry with exponential backoff.
#[derive(Debug)]
pub struct HttpTransport {
    config: BackendConfig,
    client: Client,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| EngineError::Config(format!("{}: invalid auth token: {}", config.name, e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| EngineError::Config(format!("{}: invalid header '{}': {}", config.name, key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| EngineError::Config(format!("{}: invalid header value for '{}': {}", config.name, key, e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout().min(MAX_CONNECT_TIMEOUT))
            .default_headers(headers)
            .build()
            .map_err(|e| EngineError::Config(format!("{}: {}", config.name, e)))?;

        Ok(Self {
            config,
            client,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint(), path)
    }

    /// One GET without retries, for probes.
    pub async fn probe(&self, path: &str) -> Result<Response> {
        self.ensure_open()?;
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(resp).await
    }

    /// Send the request built by `build`, retrying connection failures and
    /// timeouts up to `retry.max_attempts` total attempts.
    pub async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let policy = &self.config.retry;
        let mut attempt = 0;

        loop {
            self.ensure_open()?;

            let result = match build(&self.client).send().await {
                Ok(resp) => check_status(resp).await,
                Err(e) => Err(map_reqwest_error(e)),
            };

            let err = match result {
                Ok(resp) => return Ok(resp),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt + 1 >= policy.max_attempts {
                return Err(err);
            }

            let delay = policy.delay_for(attempt);
            warn!(
                engine = %self.config.name,
                attempt = attempt + 1,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Request failed, retrying: {}",
                err
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(engine = %self.config.name, "Closed HTTP transport");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.is_closed() {
            true => Err(EngineError::Connection(format!(
                "{}: adapter has been closed",
                self.config.name
            ))),
            false => Ok(()),
        }
    }
}

/// Map non-2xx responses onto the error taxonomy.
pub async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let body = body[..floor_char_boundary(&body, ERROR_BODY_LIMIT)].to_string();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(EngineError::Authentication(format!("{} - {}", status, body)))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            Err(EngineError::Timeout(format!("{} - {}", status, body)))
        }
        _ => Err(EngineError::Http {
            status: status.as_u16(),
            body,
        }),
    }
}

pub fn map_reqwest_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        return EngineError::Timeout(e.to_string());
    }
    if e.is_decode() {
        return EngineError::Parse(e.to_string());
    }
    EngineError::Connection(e.to_string())
}

pub fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

/// Body as JSON when it parses, otherwise the raw text as a JSON string.
pub fn parse_body(text: String) -> serde_json::Value {
    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => serde_json::Value::String(text),
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{canned_server, http_response};
    use enginebench_core::{EngineKind, RetryPolicy};
    use std::sync::atomic::Ordering;

    fn transport(base_url: String, timeout_secs: u64) -> HttpTransport {
        let mut config = BackendConfig::new("test", EngineKind::Vllm, base_url);
        config.timeout_secs = timeout_secs;
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
        };
        HttpTransport::new(config).unwrap()
    }

    #[test]
    fn test_transport_rejects_invalid_config() {
        let bad = BackendConfig::new("bad", EngineKind::Vllm, "ftp://nowhere");
        assert!(matches!(HttpTransport::new(bad), Err(EngineError::Config(_))));

        let mut bad_header = BackendConfig::new("h", EngineKind::Vllm, "http://localhost:8000");
        bad_header.headers.insert("bad header".into(), "x".into());
        assert!(matches!(HttpTransport::new(bad_header), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let config = BackendConfig::new("o", EngineKind::Ollama, "http://localhost:11434/");
        let transport = HttpTransport::new(config).unwrap();
        assert_eq!(transport.url("/api/tags"), "http://localhost:11434/api/tags");
    }

    #[tokio::test]
    async fn test_closed_transport_refuses_requests() {
        let config = BackendConfig::new("o", EngineKind::Ollama, "http://127.0.0.1:9");
        let transport = HttpTransport::new(config).unwrap();
        transport.close();
        transport.close();
        assert!(transport.is_closed());
        let err = transport.probe("/api/version").await.unwrap_err();
        assert!(matches!(err, EngineError::Connection(_)));
    }

    #[test]
    fn test_parse_body_falls_back_to_text() {
        assert_eq!(parse_body("{\"a\":1}".into())["a"], 1);
        assert_eq!(parse_body("not json".into()), serde_json::Value::String("not json".into()));
    }

    #[test]
    fn test_error_body_truncation_respects_utf8() {
        let s = "é".repeat(300);
        let cut = floor_char_boundary(&s, ERROR_BODY_LIMIT);
        assert!(cut <= ERROR_BODY_LIMIT);
        assert!(s.is_char_boundary(cut));
    }

    #[tokio::test]
    async fn test_timeouts_retried_up_to_max_attempts() {
        let (url, connections) = canned_server(vec![None]).await;
        let transport = transport(url, 1);
        let endpoint = transport.url("/v1/completions");

        let err = transport
            .send_with_retry(|client| client.post(&endpoint).body("{}"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Timeout(_)), "got {:?}", err);
        assert_eq!(connections.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let (url, connections) =
            canned_server(vec![http_response("401 Unauthorized", &[], "bad token")]).await;
        let transport = transport(url, 5);
        let endpoint = transport.url("/generate");

        let err = transport
            .send_with_retry(|client| client.post(&endpoint).body("{}"))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Authentication(ref m) if m.contains("bad token")));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_maps_to_http_status() {
        let body = "x".repeat(2000);
        let (url, connections) =
            canned_server(vec![http_response("503 Service Unavailable", &[], &body)]).await;
        let transport = transport(url, 5);

        let err = transport.probe("/health").await.unwrap_err();
        match err {
            EngineError::Http { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body.len(), ERROR_BODY_LIMIT);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_refused_is_retried_then_surfaced() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = transport(format!("http://{}", addr), 5);
        let endpoint = transport.url("/api/generate");
        let err = transport
            .send_with_retry(|client| client.post(&endpoint).body("{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Connection(_)));
    }
}
