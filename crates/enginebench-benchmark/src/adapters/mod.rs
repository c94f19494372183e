pub mod http;
pub mod ollama;
pub mod stream;
pub mod tgi;
pub mod vllm;

use std::sync::Arc;

use enginebench_core::{BackendConfig, EngineKind, ParsedMetrics, RawMetrics, RequestResult, Result};
use tracing::warn;

use crate::adapter::{AdapterFactory, EngineAdapter, RawResponse, TimingHints};

pub use ollama::OllamaAdapter;
pub use tgi::TgiAdapter;
pub use vllm::VllmAdapter;

/// Builds the HTTP adapter matching `config.kind`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpAdapterFactory;

impl AdapterFactory for HttpAdapterFactory {
    fn create(&self, config: BackendConfig) -> Result<Arc<dyn EngineAdapter>> {
        let adapter: Arc<dyn EngineAdapter> = match config.kind {
            EngineKind::Ollama => Arc::new(OllamaAdapter::new(config)?),
            EngineKind::Vllm => Arc::new(VllmAdapter::new(config)?),
            EngineKind::Tgi => Arc::new(TgiAdapter::new(config)?),
        };
        Ok(adapter)
    }
}

/// Turn a received response into a `RequestResult`.
///
/// A body the adapter cannot interpret becomes an unsuccessful result that
/// still carries its raw capture and timing.
pub(crate) fn finish_request<A>(
    adapter: &A,
    prompt: &str,
    response_text: String,
    raw: RawResponse,
    timing: TimingHints,
) -> RequestResult
where
    A: EngineAdapter + ?Sized,
{
    let mut parsed = match adapter.parse_metrics(&raw, &timing) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(engine = adapter.name(), request_id = %timing.request_id, "Unparseable response: {}", e);
            let mut failed = base_metrics(adapter, &timing);
            failed.mark_failed(e.kind(), e.to_string());
            failed
        }
    };

    if let Some(first) = timing.first_token {
        parsed.record_first_token(first);
    }
    parsed.derive();

    let raw_metrics = RawMetrics {
        request_id: timing.request_id,
        engine_name: adapter.name().to_string(),
        engine_type: adapter.kind(),
        timestamp: timing.started_at,
        prompt: prompt.to_string(),
        response_text: response_text.clone(),
        request_duration: timing.total_duration,
        raw_response: raw.body,
        response_headers: raw.headers,
        first_token_time: timing.first_token,
    };

    RequestResult::completed(response_text, raw_metrics, parsed)
}

/// Base metrics every adapter starts from.
pub(crate) fn base_metrics<A>(adapter: &A, timing: &TimingHints) -> ParsedMetrics
where
    A: EngineAdapter + ?Sized,
{
    let mut metrics = ParsedMetrics::new(
        timing.request_id.clone(),
        adapter.name(),
        adapter.kind(),
        timing.model.clone(),
        timing.started_at,
    );
    metrics.total_duration = Some(timing.total_duration);
    metrics
}
