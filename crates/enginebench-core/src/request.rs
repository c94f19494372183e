use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ParsedMetrics, RawMetrics};

/// Sampling options; each adapter maps these onto its own wire fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stop: Vec<String>,
}

impl RequestOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Per-call envelope exchanged between the collector, adapters and the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    pub success: bool,
    pub response_text: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub raw_metrics: Option<RawMetrics>,
    #[serde(default)]
    pub parsed_metrics: Option<ParsedMetrics>,
}

impl RequestResult {
    pub fn completed(response_text: String, raw: RawMetrics, parsed: ParsedMetrics) -> Self {
        Self {
            success: parsed.success,
            error_message: parsed.error_message.clone(),
            response_text,
            raw_metrics: Some(raw),
            parsed_metrics: Some(parsed),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            response_text: String::new(),
            error_message: Some(message.into()),
            raw_metrics: None,
            parsed_metrics: None,
        }
    }

    pub fn total_duration(&self) -> Option<f64> {
        self.parsed_metrics.as_ref().and_then(|m| m.total_duration)
    }

    pub fn first_token_latency(&self) -> Option<f64> {
        self.parsed_metrics.as_ref().and_then(|m| m.first_token_latency)
    }

    pub fn output_tokens(&self) -> Option<u64> {
        self.parsed_metrics.as_ref().and_then(|m| m.eval_count)
    }
}

/// One streamed token, stamped when the adapter read it off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEvent {
    pub text: String,
    pub elapsed: Duration,
}

impl TokenEvent {
    pub fn new(text: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            text: text.into(),
            elapsed,
        }
    }
}
