//! Scripted adapter for unit tests. Behaviour is picked by prompt keyword:
//! `panic`, `timeout`, `refused` and `malformed` trigger the matching failure,
//! anything else succeeds after `latency`. Also a canned loopback HTTP server
//! for exercising the real adapters.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use enginebench_core::metrics::unix_now;
use enginebench_core::{
    BackendConfig, EngineCapabilities, EngineError, EngineInfo, HealthStatus, ModelInfo,
    ParsedMetrics, RequestOptions, RequestResult, Result, TokenEvent,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::adapter::{AdapterFactory, EngineAdapter, RawResponse, TimingHints};
use crate::adapters::stream::StreamCapture;
use crate::adapters::{base_metrics, finish_request};

pub struct MockAdapter {
    config: BackendConfig,
    healthy: AtomicBool,
    pub probes: AtomicUsize,
    pub requests: AtomicUsize,
    pub closes: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    latency: Duration,
    token_gap: Duration,
    tokens: Vec<String>,
}

impl MockAdapter {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            healthy: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            latency: Duration::from_millis(50),
            token_gap: Duration::from_millis(10),
            tokens: ["The", " sky", " is", " blue"].iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn begin(&self, prompt: &str) -> Result<InFlight<'_>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if prompt.contains("panic") {
            panic!("mock adapter panicked on purpose");
        }
        if prompt.contains("timeout") {
            return Err(EngineError::Timeout(format!("{}: request timed out", self.config.name)));
        }
        if prompt.contains("refused") {
            return Err(EngineError::Connection(format!("{}: connection refused", self.config.name)));
        }
        Ok(guard)
    }

    fn body(&self, prompt: &str) -> serde_json::Value {
        match prompt.contains("malformed") {
            true => serde_json::Value::String("<html>502</html>".into()),
            false => json!({
                "prompt_tokens": prompt.split_whitespace().count(),
                "output_tokens": self.tokens.len(),
            }),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineAdapter for MockAdapter {
    fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        match self.healthy.load(Ordering::SeqCst) {
            true => Ok(HealthStatus::healthy(&self.config.name, 0.001)
                .with_version(Some("mock-1.0".into()))),
            false => Err(EngineError::Connection(format!("{}: connection refused", self.config.name))),
        }
    }

    async fn get_info(&self) -> Result<EngineInfo> {
        Ok(EngineInfo {
            engine_name: self.config.name.clone(),
            version: Some("mock-1.0".into()),
            capabilities: EngineCapabilities {
                streaming: true,
                native_timing: false,
                model_listing: true,
            },
            features: vec!["mock".into()],
            model_count: 1,
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        match self.healthy.load(Ordering::SeqCst) {
            true => Ok(vec![ModelInfo::named(format!("{}-model", self.config.name))]),
            false => Err(EngineError::Connection("unreachable".into())),
        }
    }

    async fn send_single_request(
        &self,
        prompt: &str,
        model: &str,
        _options: &RequestOptions,
    ) -> Result<RequestResult> {
        let started_at = unix_now();
        let start = Instant::now();
        let _guard = self.begin(prompt)?;
        tokio::time::sleep(self.latency).await;

        let timing = TimingHints {
            request_id: Uuid::new_v4().to_string(),
            model: model.to_string(),
            started_at,
            total_duration: start.elapsed().as_secs_f64(),
            first_token: None,
            last_token: None,
            token_events: 0,
        };
        let text = self.tokens.concat();
        Ok(finish_request(self, prompt, text, RawResponse::new(self.body(prompt)), timing))
    }

    async fn send_streaming_request(
        &self,
        prompt: &str,
        model: &str,
        tokens: mpsc::Sender<TokenEvent>,
        _options: &RequestOptions,
    ) -> Result<RequestResult> {
        let started_at = unix_now();
        let start = Instant::now();
        let _guard = self.begin(prompt)?;
        tokio::time::sleep(self.latency).await;

        let mut capture = StreamCapture::new(start, tokens);
        for token in &self.tokens {
            capture.token(token).await;
            tokio::time::sleep(self.token_gap).await;
        }

        let timing = capture.timing(Uuid::new_v4().to_string(), model, started_at);
        let raw = RawResponse::new(self.body(prompt));
        Ok(finish_request(self, prompt, capture.into_text(), raw, timing))
    }

    fn parse_metrics(&self, raw: &RawResponse, timing: &TimingHints) -> Result<ParsedMetrics> {
        let Some(body) = raw.body.as_object() else {
            return Err(EngineError::Parse("mock body is not an object".into()));
        };
        let mut metrics = base_metrics(self, timing);
        metrics.prompt_eval_count = body.get("prompt_tokens").and_then(|v| v.as_u64());
        metrics.eval_count = body.get("output_tokens").and_then(|v| v.as_u64());
        metrics.eval_duration = timing.streamed_generation_time();
        Ok(metrics)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Builds `MockAdapter`s and keeps a handle to each for assertions.
#[derive(Default)]
pub struct MockFactory {
    unhealthy: Vec<String>,
    latency: Option<Duration>,
    pub created: DashMap<String, Arc<MockAdapter>>,
}

impl MockFactory {
    pub fn with_unhealthy(names: &[&str]) -> Self {
        Self {
            unhealthy: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn adapter(&self, name: &str) -> Arc<MockAdapter> {
        self.created
            .get(name)
            .map(|a| Arc::clone(a.value()))
            .expect("mock adapter was never created")
    }
}

impl AdapterFactory for MockFactory {
    fn create(&self, config: BackendConfig) -> Result<Arc<dyn EngineAdapter>> {
        config.validate()?;
        let name = config.name.clone();
        let mut adapter = MockAdapter::new(config);
        if let Some(latency) = self.latency {
            adapter = adapter.with_latency(latency);
        }
        adapter.set_healthy(!self.unhealthy.contains(&name));

        let adapter = Arc::new(adapter);
        self.created.insert(name, Arc::clone(&adapter));
        Ok(adapter)
    }
}

/// Loopback HTTP server answering each connection with the next canned
/// response (the last one repeats). `None` holds the connection open without
/// answering. Returns the base URL and a connection counter.
pub async fn canned_server(responses: Vec<Option<String>>) -> (String, Arc<AtomicUsize>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut socket, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let response = responses.get(n).or(responses.last()).cloned().flatten();

            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !request_complete(&request) {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => request.extend_from_slice(&buf[..read]),
                }
            }

            match response {
                Some(body) => {
                    let _ = socket.write_all(body.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
                None => held.push(socket),
            }
        }
    });

    (format!("http://{}", addr), connections)
}

fn request_complete(request: &[u8]) -> bool {
    let text = String::from_utf8_lossy(request);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..header_end]
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    request.len() >= header_end + 4 + content_length
}

/// A complete HTTP/1.1 response with `Connection: close`.
pub fn http_response(status: &str, headers: &[(&str, &str)], body: &str) -> Option<String> {
    let mut out = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        body.len()
    );
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");
    out.push_str(body);
    Some(out)
}
