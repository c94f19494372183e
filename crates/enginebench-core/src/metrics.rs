use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{EngineKind, ErrorKind};

/// Fixed allowance added to partial pre-generation timing when estimating TTFT.
pub const TTFT_ESTIMATE_OFFSET_SECS: f64 = 0.010;

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Unmodified wire capture for one request. Export/debugging only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMetrics {
    pub request_id: String,
    pub engine_name: String,
    pub engine_type: EngineKind,
    pub timestamp: f64,
    pub prompt: String,
    pub response_text: String,
    /// Wall clock seconds from send to last byte.
    pub request_duration: f64,
    pub raw_response: serde_json::Value,
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    /// Seconds from send to the first streamed token; `None` when no token was
    /// observed directly, which marks any TTFT on the parsed side as estimated.
    #[serde(default)]
    pub first_token_time: Option<f64>,
}

/// Where `first_token_latency` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtftSource {
    Measured,
    PartialTiming,
    DurationRatio,
}

/// Standardized per-request metrics. Durations are seconds, timestamps epoch seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedMetrics {
    pub request_id: String,
    pub engine_name: String,
    pub engine_type: EngineKind,
    pub model_name: String,
    pub timestamp: f64,
    pub success: bool,

    pub total_duration: Option<f64>,
    pub load_duration: Option<f64>,
    pub prompt_eval_count: Option<u64>,
    pub prompt_eval_duration: Option<f64>,
    pub prompt_token_rate: Option<f64>,
    pub eval_count: Option<u64>,
    pub eval_duration: Option<f64>,
    pub response_token_rate: Option<f64>,
    pub first_token_latency: Option<f64>,
    pub inter_token_latency: Option<f64>,
    pub queueing_time: Option<f64>,

    #[serde(default)]
    pub pre_generation_time: Option<f64>,
    #[serde(default)]
    pub ttft_source: Option<TtftSource>,
    /// `eval_duration` was inferred from the wall clock, not reported.
    #[serde(default)]
    pub eval_duration_estimated: bool,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ParsedMetrics {
    pub fn new(
        request_id: impl Into<String>,
        engine_name: impl Into<String>,
        engine_type: EngineKind,
        model_name: impl Into<String>,
        timestamp: f64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            engine_name: engine_name.into(),
            engine_type,
            model_name: model_name.into(),
            timestamp,
            success: true,
            total_duration: None,
            load_duration: None,
            prompt_eval_count: None,
            prompt_eval_duration: None,
            prompt_token_rate: None,
            eval_count: None,
            eval_duration: None,
            response_token_rate: None,
            first_token_latency: None,
            inter_token_latency: None,
            queueing_time: None,
            pre_generation_time: None,
            ttft_source: None,
            eval_duration_estimated: false,
            error_kind: None,
            error_message: None,
        }
    }

    pub fn mark_failed(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.success = false;
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
    }

    /// Record a first-token time observed on the wire. Wins over any estimate.
    pub fn record_first_token(&mut self, seconds: f64) {
        self.first_token_latency = Some(seconds);
        self.ttft_source = Some(TtftSource::Measured);
    }

    pub fn ttft_is_estimated(&self) -> bool {
        matches!(
            self.ttft_source,
            Some(TtftSource::PartialTiming | TtftSource::DurationRatio)
        )
    }

    /// Fill the derived fields from the directly reported ones.
    ///
    /// Rates and inter-token latency are always recomputed; adapter-supplied
    /// values are discarded. Safe to call more than once.
    pub fn derive(&mut self) {
        self.prompt_token_rate = rate(self.prompt_eval_count, self.prompt_eval_duration);
        self.response_token_rate = rate(self.eval_count, self.eval_duration);
        self.inter_token_latency = match (self.eval_count, self.eval_duration) {
            (Some(count), Some(duration)) if count > 0 => Some(duration / count as f64),
            _ => None,
        };

        if self.ttft_source == Some(TtftSource::Measured) || !self.success {
            return;
        }

        let total = self.total_duration.filter(|t| *t > 0.0);
        let estimate = match (self.pre_generation_time.filter(|p| *p >= 0.0), total) {
            (Some(pre), total) => {
                let ttft = pre + TTFT_ESTIMATE_OFFSET_SECS;
                Some((total.map_or(ttft, |t| ttft.min(t)), TtftSource::PartialTiming))
            }
            (None, Some(total)) => Some((
                total * self.engine_type.ttft_fallback_ratio(),
                TtftSource::DurationRatio,
            )),
            (None, None) => None,
        };

        self.first_token_latency = estimate.map(|(v, _)| v);
        self.ttft_source = estimate.map(|(_, s)| s);
    }
}

fn rate(count: Option<u64>, duration: Option<f64>) -> Option<f64> {
    match (count, duration) {
        (Some(count), Some(duration)) if count > 0 && duration > 0.0 => {
            Some(count as f64 / duration)
        }
        _ => None,
    }
}

/// Convert a nanosecond counter (Ollama) to seconds.
pub fn nanos_to_secs(ns: u64) -> f64 {
    ns as f64 / 1_000_000_000.0
}

/// Convert a millisecond value (TGI headers) to seconds.
pub fn millis_to_secs(ms: f64) -> f64 {
    ms / 1000.0
}
