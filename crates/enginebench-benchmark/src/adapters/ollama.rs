use async_trait::async_trait;
use enginebench_core::metrics::{nanos_to_secs, unix_now};
use enginebench_core::{
    BackendConfig, EngineCapabilities, EngineError, EngineInfo, HealthStatus, ModelInfo,
    ParsedMetrics, RequestOptions, RequestResult, Result, TokenEvent,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::http::{header_map, map_reqwest_error, parse_body, HttpTransport};
use super::stream::{LineReader, StreamCapture};
use super::{base_metrics, finish_request};
use crate::adapter::{EngineAdapter, RawResponse, TimingHints};

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    details: Option<ModelDetails>,
}

#[derive(Debug, Deserialize)]
struct ModelDetails {
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    parameter_size: Option<String>,
    #[serde(default)]
    quantization_level: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions<'a>>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

/// Generate response; the final (or only) object carries nanosecond timing.
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    load_duration: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    prompt_eval_duration: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug)]
pub struct OllamaAdapter {
    http: HttpTransport,
}

impl OllamaAdapter {
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
    ) -> GenerateRequest<'a> {
        let has_options = options.temperature.is_some()
            || options.max_tokens.is_some()
            || options.top_p.is_some()
            || options.top_k.is_some()
            || !options.stop.is_empty();

        GenerateRequest {
            model,
            prompt,
            stream,
            options: has_options.then(|| GenerateOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
                top_p: options.top_p,
                top_k: options.top_k,
                stop: (!options.stop.is_empty()).then_some(options.stop.as_slice()),
            }),
        }
    }

    async fn version(&self) -> Result<String> {
        let resp = self.http.probe("/api/version").await?;
        let version: VersionResponse = resp.json().await.map_err(map_reqwest_error)?;
        Ok(version.version)
    }
}

#[async_trait]
impl EngineAdapter for OllamaAdapter {
    fn config(&self) -> &BackendConfig {
        self.http.config()
    }

    #[instrument(skip(self), fields(engine = %self.name()))]
    async fn health_check(&self) -> Result<HealthStatus> {
        let start = Instant::now();
        let version = self.version().await?;
        let status = HealthStatus::healthy(self.name(), start.elapsed().as_secs_f64())
            .with_version(Some(version));
        debug!(response_time = status.response_time, "Ollama healthy");
        Ok(status)
    }

    async fn get_info(&self) -> Result<EngineInfo> {
        let version = self.version().await.ok();
        let models = self.list_models().await?;

        Ok(EngineInfo {
            engine_name: self.name().to_string(),
            version,
            capabilities: EngineCapabilities {
                streaming: true,
                native_timing: true,
                model_listing: true,
            },
            features: vec![
                "generate".to_string(),
                "chat".to_string(),
                "embeddings".to_string(),
                "model_management".to_string(),
            ],
            model_count: models.len(),
        })
    }

    #[instrument(skip(self), fields(engine = %self.name()))]
    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let resp = self.http.probe("/api/tags").await?;
        let tags: TagsResponse = resp.json().await.map_err(map_reqwest_error)?;
        info!(count = tags.models.len(), "Fetched models from Ollama");

        let models = tags
            .models
            .into_iter()
            .map(|m| {
                let details = m.details.unwrap_or(ModelDetails {
                    family: None,
                    parameter_size: None,
                    quantization_level: None,
                });
                ModelInfo {
                    name: m.name,
                    family: details.family,
                    size_bytes: m.size,
                    parameter_size: details.parameter_size,
                    quantization: details.quantization_level,
                    available: true,
                }
            })
            .collect();

        Ok(models)
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
        let url = self.http.url("/api/generate");
        let body = Self::request_body(prompt, model, options, false);

        let resp = self
            .http
            .send_with_retry(|client| client.post(&url).json(&body))
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
            .get("response")
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
        let url = self.http.url("/api/generate");
        let body = Self::request_body(prompt, model, options, true);

        let resp = self
            .http
            .send_with_retry(|client| client.post(&url).json(&body))
            .await?;
        let headers = header_map(resp.headers());

        let mut capture = StreamCapture::new(start, tokens);
        let mut reader = LineReader::new(resp.bytes_stream());
        let mut final_line = serde_json::Value::Null;

        while let Some(line) = reader.next_line().await? {
            let value = parse_body(line);
            let Ok(chunk) = serde_json::from_value::<GenerateResponse>(value.clone()) else {
                debug!("Skipping unrecognised stream line");
                continue;
            };

            if let Some(err) = chunk.error {
                return Err(EngineError::Backend(err));
            }

            capture.token(&chunk.response).await;

            if chunk.done {
                final_line = value;
                break;
            }
        }

        let timing = capture.timing(request_id, model, started_at);
        let raw = RawResponse {
            body: final_line,
            headers,
        };
        Ok(finish_request(self, prompt, capture.into_text(), raw, timing))
    }

    fn parse_metrics(&self, raw: &RawResponse, timing: &TimingHints) -> Result<ParsedMetrics> {
        let resp: GenerateResponse = serde_json::from_value(raw.body.clone())
            .map_err(|e| EngineError::Parse(format!("Ollama response: {}", e)))?;

        if !resp.done {
            return Err(EngineError::Parse("Ollama response ended before done=true".into()));
        }

        let mut metrics = base_metrics(self, timing);
        metrics.load_duration = resp.load_duration.map(nanos_to_secs);
        metrics.prompt_eval_count = resp.prompt_eval_count;
        metrics.prompt_eval_duration = resp.prompt_eval_duration.map(nanos_to_secs);
        metrics.eval_count = resp.eval_count.or(timing.streamed_token_count());
        metrics.eval_duration = resp.eval_duration.map(nanos_to_secs);
        metrics.pre_generation_time = match (metrics.load_duration, metrics.prompt_eval_duration) {
            (None, None) => None,
            (load, prompt) => Some(load.unwrap_or(0.0) + prompt.unwrap_or(0.0)),
        };

        Ok(metrics)
    }

    async fn close(&self) {
        self.http.close();
    }
}
