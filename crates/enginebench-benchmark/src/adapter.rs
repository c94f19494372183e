use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use enginebench_core::{
    BackendConfig, EngineInfo, EngineKind, HealthStatus, ModelInfo, ParsedMetrics,
    RequestOptions, RequestResult, Result, TokenEvent,
};
use tokio::sync::mpsc;

/// Wire body and headers as received, before any interpretation.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub body: serde_json::Value,
    pub headers: BTreeMap<String, String>,
}

impl RawResponse {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            body,
            headers: BTreeMap::new(),
        }
    }

    pub fn header_f64(&self, name: &str) -> Option<f64> {
        self.headers.get(name).and_then(|v| v.trim().parse().ok())
    }
}

/// Client-side timing collected around one request.
#[derive(Debug, Clone)]
pub struct TimingHints {
    pub request_id: String,
    pub model: String,
    /// Epoch seconds when the request was sent.
    pub started_at: f64,
    /// Seconds from send to the end of the response body.
    pub total_duration: f64,
    /// Seconds from send to the first streamed token.
    pub first_token: Option<f64>,
    /// Seconds from send to the last streamed token.
    pub last_token: Option<f64>,
    pub token_events: usize,
}

impl TimingHints {
    /// Time spent generating after the first token arrived, when it was observed.
    pub fn streamed_generation_time(&self) -> Option<f64> {
        self.first_token
            .map(|first| self.total_duration - first)
            .filter(|d| *d > 0.0)
    }

    pub fn streamed_token_count(&self) -> Option<u64> {
        (self.token_events > 0).then_some(self.token_events as u64)
    }
}

/// One backend protocol. Implementations fill only what the backend reports;
/// the engine derives the rest.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn config(&self) -> &BackendConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    fn kind(&self) -> EngineKind {
        self.config().kind
    }

    async fn health_check(&self) -> Result<HealthStatus>;

    async fn get_info(&self) -> Result<EngineInfo>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    /// `Err` only when no usable response was received (after retries).
    async fn send_single_request(
        &self,
        prompt: &str,
        model: &str,
        options: &RequestOptions,
    ) -> Result<RequestResult>;

    /// Tokens are sent on `tokens` in arrival order, each stamped at read time.
    async fn send_streaming_request(
        &self,
        prompt: &str,
        model: &str,
        tokens: mpsc::Sender<TokenEvent>,
        options: &RequestOptions,
    ) -> Result<RequestResult>;

    fn parse_metrics(&self, raw: &RawResponse, timing: &TimingHints) -> Result<ParsedMetrics>;

    /// Release connection resources. Calling twice is a no-op.
    async fn close(&self);
}

/// Builds adapters from configs; the registry goes through this so tests can
/// substitute their own.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, config: BackendConfig) -> Result<Arc<dyn EngineAdapter>>;
}
