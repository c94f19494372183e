use async_trait::async_trait;
use enginebench_core::metrics::unix_now;
use enginebench_core::{
    BackendConfig, EngineCapabilities, EngineError, EngineInfo, HealthStatus, ModelInfo,
    ParsedMetrics, RequestOptions, RequestResult, Result, TokenEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::http::{header_map, map_reqwest_error, parse_body, HttpTransport};
use super::stream::{sse_data, LineReader, StreamCapture};
use super::{base_metrics, finish_request};
use crate::adapter::{EngineAdapter, RawResponse, TimingHints};

const SSE_DONE: &str = "[DONE]";

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelCard>,
}

#[derive(Debug, Deserialize)]
struct ModelCard {
    id: String,
    #[serde(default)]
    owned_by: Option<String>,
    #[serde(default)]
    max_model_len: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

/// OpenAI-compatible completions server (vLLM). Reports token counts only,
/// so every timing figure comes from the client clock.
#[derive(Debug)]
pub struct VllmAdapter {
    http: HttpTransport,
}

impl VllmAdapter {
    pub fn new(config: BackendConfig) -> Result<Self> {
        Ok(Self {
            http: HttpTransport::new(config)?,
        })
    }

    fn request_body<'a>(
        prompt: &'a str,
        model: &'a str,
        options: &'a RequestOptions,
        stream: bool,
    ) -> CompletionRequest<'a> {
        CompletionRequest {
            model,
            prompt,
            stream,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
            stop: (!options.stop.is_empty()).then_some(options.stop.as_slice()),
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        }
    }

    async fn version(&self) -> Option<String> {
        let resp = self.http.probe("/version").await.ok()?;
        let body: Value = resp.json().await.ok()?;
        body.get("version").and_then(|v| v.as_str()).map(str::to_string)
    }

    async fn models(&self) -> Result<Vec<ModelCard>> {
        let resp = self.http.probe("/v1/models").await?;
        let list: ModelList = resp.json().await.map_err(map_reqwest_error)?;
        Ok(list.data)
    }
}

#[async_trait]
impl EngineAdapter for VllmAdapter {
    fn config(&self) -> &BackendConfig {
        self.http.config()
    }

    #[instrument(skip(self), fields(engine = %self.name()))]
    async fn health_check(&self) -> Result<HealthStatus> {
        let start = Instant::now();
        self.http.probe("/health").await?;
        let response_time = start.elapsed().as_secs_f64();

        let mut status =
            HealthStatus::healthy(self.name(), response_time).with_version(self.version().await);
        if let Ok(models) = self.models().await {
            status.diagnostics.insert(
                "models".to_string(),
                Value::from(models.into_iter().map(|m| m.id).collect::<Vec<_>>()),
            );
        }
        debug!(response_time, "vLLM healthy");
        Ok(status)
    }

    async fn get_info(&self) -> Result<EngineInfo> {
        let version = self.version().await;
        let models = self.models().await?;

        Ok(EngineInfo {
            engine_name: self.name().to_string(),
            version,
            capabilities: EngineCapabilities {
                streaming: true,
                native_timing: false,
                model_listing: true,
            },
            features: vec![
                "completions".to_string(),
                "chat_completions".to_string(),
                "openai_compatible".to_string(),
                "stream_usage".to_string(),
            ],
            model_count: models.len(),
        })
    }

    #[instrument(skip(self), fields(engine = %self.name()))]
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let cards = self.models().await?;
        info!(count = cards.len(), "Fetched models from vLLM");

        Ok(cards
            .into_iter()
            .map(|card| {
                let mut model = ModelInfo::named(card.id);
                model.family = card.owned_by;
                model.parameter_size = card.max_model_len.map(|len| format!("ctx {}", len));
                model
            })
            .collect())
    }

    #[instrument(skip(self, prompt, options), fields(engine = %self.name(), model = %model))]
    async fn send_single_request(
        &self,
        prompt: &str,
        model: &str,
        options: &RequestOptions,
    ) -> Result<RequestResult> {
        let request_id = Uuid::new_v4().to_string();
        let started_at = unix_now();
        let start = Instant::now();
        let url = self.http.url("/v1/completions");
        let request = Self::request_body(prompt, model, options, false);

        let resp = self
            .http
            .send_with_retry(|client| client.post(&url).json(&request))
            .await?;
        let headers = header_map(resp.headers());
        let text = resp.text().await.map_err(map_reqwest_error)?;

        let timing = TimingHints {
            request_id,
            model: model.to_string(),
            started_at,
            total_duration: start.elapsed().as_secs_f64(),
            first_token: None,
            last_token: None,
            token_events: 0,
        };

        let body = parse_body(text);
        let response_text = body
            .pointer("/choices/0/text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(finish_request(self, prompt, response_text, RawResponse { body, headers }, timing))
    }

    #[instrument(skip(self, prompt, tokens, options), fields(engine = %self.name(), model = %model))]
    async fn send_streaming_request(
        &self,
        prompt: &str,
        model: &str,
        tokens: mpsc::Sender<TokenEvent>,
        options: &RequestOptions,
    ) -> Result<RequestResult> {
        let request_id = Uuid::new_v4().to_string();
        let started_at = unix_now();
        let start = Instant::now();
        let url = self.http.url("/v1/completions");
        let request = Self::request_body(prompt, model, options, true);

        let resp = self
            .http
            .send_with_retry(|client| client.post(&url).json(&request))
            .await?;
        let headers = header_map(resp.headers());

        let mut capture = StreamCapture::new(start, tokens);
        let mut reader = LineReader::new(resp.bytes_stream());
        let mut usage_chunk = Value::Null;

        while let Some(line) = reader.next_line().await? {
            let Some(data) = sse_data(&line) else {
                continue;
            };
            if data == SSE_DONE {
                break;
            }

            let value = parse_body(data.to_string());
            if let Some(message) = value.pointer("/error/message").and_then(|v| v.as_str()) {
                return Err(EngineError::Backend(message.to_string()));
            }

            let Ok(chunk) = serde_json::from_value::<CompletionResponse>(value.clone()) else {
                debug!("Skipping unrecognised SSE event");
                continue;
            };
            for choice in &chunk.choices {
                capture.token(&choice.text).await;
            }
            if chunk.usage.is_some() {
                usage_chunk = value;
            }
        }

        let timing = capture.timing(request_id, model, started_at);
        let raw = RawResponse {
            body: usage_chunk,
            headers,
        };
        Ok(finish_request(self, prompt, capture.into_text(), raw, timing))
    }

    fn parse_metrics(&self, raw: &RawResponse, timing: &TimingHints) -> Result<ParsedMetrics> {
        let mut metrics = base_metrics(self, timing);

        // A stream without a usage chunk still has client-side counts.
        let usage = match &raw.body {
            Value::Null if timing.token_events > 0 => None,
            body => {
                let resp: CompletionResponse = serde_json::from_value(body.clone())
                    .map_err(|e| EngineError::Parse(format!("vLLM response: {}", e)))?;
                resp.usage
            }
        };

        metrics.prompt_eval_count = usage.as_ref().and_then(|u| u.prompt_tokens);
        metrics.eval_count = usage
            .as_ref()
            .and_then(|u| u.completion_tokens)
            .or(timing.streamed_token_count());
        metrics.eval_duration = timing.streamed_generation_time();

        // Non-streaming responses carry no timing: generation time is the
        // wall clock minus the same ratio-based TTFT estimate derive() applies.
        if metrics.eval_duration.is_none() && metrics.eval_count.is_some_and(|n| n > 0) {
            let ratio = self.kind().ttft_fallback_ratio();
            metrics.eval_duration = Some(timing.total_duration * (1.0 - ratio)).filter(|d| *d > 0.0);
            metrics.eval_duration_estimated = metrics.eval_duration.is_some();
        }

        Ok(metrics)
    }

    async fn close(&self) {
        self.http.close();
    }
}
