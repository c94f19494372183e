use async_trait::async_trait;
use enginebench_core::metrics::{millis_to_secs, unix_now};
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

const HEADER_QUEUE_TIME: &str = "x-queue-time";
const HEADER_VALIDATION_TIME: &str = "x-validation-time";
const HEADER_INFERENCE_TIME: &str = "x-inference-time";
const HEADER_PROMPT_TOKENS: &str = "x-prompt-tokens";
const HEADER_GENERATED_TOKENS: &str = "x-generated-tokens";

#[derive(Debug, Deserialize)]
struct InfoResponse {
    model_id: String,
    #[serde(default)]
    model_dtype: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    max_input_tokens: Option<u64>,
    #[serde(default)]
    max_total_tokens: Option<u64>,
    #[serde(default)]
    max_concurrent_requests: Option<u64>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    inputs: &'a str,
    parameters: Parameters<'a>,
}

#[derive(Debug, Serialize)]
struct Parameters<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_new_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    details: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    generated_text: Option<String>,
    #[serde(default)]
    details: Option<Details>,
}

#[derive(Debug, Deserialize)]
struct Details {
    #[serde(default)]
    generated_tokens: Option<u64>,
    #[serde(default)]
    prefill: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    token: Option<StreamToken>,
    #[serde(default)]
    generated_text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamToken {
    #[serde(default)]
    text: String,
    #[serde(default)]
    special: bool,
}

/// Hugging Face text-generation-inference. Timing arrives as millisecond
/// response headers on the non-streaming endpoint.
#[derive(Debug)]
pub struct TgiAdapter {
    http: HttpTransport,
}

impl TgiAdapter {
    pub fn new(config: BackendConfig) -> Result<Self> {
        Ok(Self {
            http: HttpTransport::new(config)?,
        })
    }

    fn request_body<'a>(prompt: &'a str, options: &'a RequestOptions) -> GenerateRequest<'a> {
        GenerateRequest {
            inputs: prompt,
            parameters: Parameters {
                max_new_tokens: options.max_tokens,
                temperature: options.temperature,
                top_p: options.top_p,
                top_k: options.top_k,
                stop: (!options.stop.is_empty()).then_some(options.stop.as_slice()),
                details: true,
            },
        }
    }

    async fn info(&self) -> Result<InfoResponse> {
        let resp = self.http.probe("/info").await?;
        resp.json().await.map_err(map_reqwest_error)
    }
}

#[async_trait]
impl EngineAdapter for TgiAdapter {
    fn config(&self) -> &BackendConfig {
        self.http.config()
    }

    #[instrument(skip(self), fields(engine = %self.name()))]
    async fn health_check(&self) -> Result<HealthStatus> {
        let start = Instant::now();
        self.http.probe("/health").await?;
        let response_time = start.elapsed().as_secs_f64();

        let mut status = HealthStatus::healthy(self.name(), response_time);
        if let Ok(info) = self.info().await {
            status.version = info.version;
            status
                .diagnostics
                .insert("model_id".to_string(), Value::from(info.model_id));
            if let Some(limit) = info.max_concurrent_requests {
                status
                    .diagnostics
                    .insert("max_concurrent_requests".to_string(), Value::from(limit));
            }
        }
        debug!(response_time, "TGI healthy");
        Ok(status)
    }

    async fn get_info(&self) -> Result<EngineInfo> {
        let info = self.info().await?;

        Ok(EngineInfo {
            engine_name: self.name().to_string(),
            version: info.version,
            capabilities: EngineCapabilities {
                streaming: true,
                native_timing: true,
                model_listing: true,
            },
            features: vec![
                "generate".to_string(),
                "generate_stream".to_string(),
                "timing_headers".to_string(),
            ],
            model_count: 1,
        })
    }

    /// TGI serves exactly one model, described by `/info`.
    #[instrument(skip(self), fields(engine = %self.name()))]
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let info = self.info().await?;
        info!(model = %info.model_id, "Fetched model from TGI");

        let mut model = ModelInfo::named(info.model_id);
        model.quantization = info.model_dtype;
        model.parameter_size = info
            .max_input_tokens
            .or(info.max_total_tokens)
            .map(|len| format!("ctx {}", len));
        Ok(vec![model])
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
        let url = self.http.url("/generate");
        let request = Self::request_body(prompt, options);

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
            .get("generated_text")
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
        let url = self.http.url("/generate_stream");
        let request = Self::request_body(prompt, options);

        let resp = self
            .http
            .send_with_retry(|client| client.post(&url).json(&request))
            .await?;
        let headers = header_map(resp.headers());

        let mut capture = StreamCapture::new(start, tokens);
        let mut reader = LineReader::new(resp.bytes_stream());
        let mut final_event = Value::Null;

        while let Some(line) = reader.next_line().await? {
            let Some(data) = sse_data(&line) else {
                continue;
            };
            let value = parse_body(data.to_string());
            let Ok(event) = serde_json::from_value::<StreamEvent>(value.clone()) else {
                debug!("Skipping unrecognised SSE event");
                continue;
            };

            if let Some(err) = event.error {
                return Err(EngineError::Backend(err));
            }
            if let Some(token) = event.token.filter(|t| !t.special) {
                capture.token(&token.text).await;
            }
            if event.generated_text.is_some() {
                final_event = value;
                break;
            }
        }

        let timing = capture.timing(request_id, model, started_at);
        let raw = RawResponse {
            body: final_event,
            headers,
        };
        Ok(finish_request(self, prompt, capture.into_text(), raw, timing))
    }

    fn parse_metrics(&self, raw: &RawResponse, timing: &TimingHints) -> Result<ParsedMetrics> {
        let resp: GenerateResponse = serde_json::from_value(raw.body.clone())
            .map_err(|e| EngineError::Parse(format!("TGI response: {}", e)))?;

        if resp.generated_text.is_none() && timing.token_events == 0 {
            return Err(EngineError::Parse("TGI response has no generated_text".into()));
        }

        let queue = raw.header_f64(HEADER_QUEUE_TIME).map(millis_to_secs);
        let validation = raw.header_f64(HEADER_VALIDATION_TIME).map(millis_to_secs);
        let inference = raw.header_f64(HEADER_INFERENCE_TIME).map(millis_to_secs);
        let details = resp.details.as_ref();

        let mut metrics = base_metrics(self, timing);
        metrics.queueing_time = queue;
        metrics.pre_generation_time = match (queue, validation) {
            (None, None) => None,
            (q, v) => Some(q.unwrap_or(0.0) + v.unwrap_or(0.0)),
        };
        metrics.prompt_eval_count = raw
            .header_f64(HEADER_PROMPT_TOKENS)
            .map(|n| n as u64)
            .or_else(|| details.filter(|d| !d.prefill.is_empty()).map(|d| d.prefill.len() as u64));
        metrics.eval_count = details
            .and_then(|d| d.generated_tokens)
            .or_else(|| raw.header_f64(HEADER_GENERATED_TOKENS).map(|n| n as u64))
            .or(timing.streamed_token_count());
        metrics.eval_duration = inference.or(timing.streamed_generation_time());

        Ok(metrics)
    }

    async fn close(&self) {
        self.http.close();
    }
}
