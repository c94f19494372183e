use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ParsedMetrics;

/// Percentile by linear interpolation at rank `(n - 1) * p` over an ascending
/// sample, `p` in `[0, 1]`. `None` for an empty sample.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }

    let rank = (sorted.len() - 1) as f64 * p.clamp(0.0, 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;

    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    match values.is_empty() {
        true => None,
        false => Some(values.iter().sum::<f64>() / values.len() as f64),
    }
}

/// Sample standard deviation; zero for a single value.
pub fn stddev(values: &[f64]) -> Option<f64> {
    let avg = mean(values)?;
    if values.len() < 2 {
        return Some(0.0);
    }
    let var = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Ascending copy with NaNs dropped.
pub fn sorted_sample(values: impl IntoIterator<Item = f64>) -> Vec<f64> {
    let mut sample: Vec<f64> = values.into_iter().filter(|v| !v.is_nan()).collect();
    sample.sort_by(f64::total_cmp);
    sample
}

/// Summary of one latency-like sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

impl LatencyStats {
    pub fn from_sample(values: impl IntoIterator<Item = f64>) -> Self {
        let sorted = sorted_sample(values);
        Self {
            mean: mean(&sorted),
            stddev: stddev(&sorted),
            min: sorted.first().copied(),
            max: sorted.last().copied(),
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
        }
    }
}

/// Per-engine rollup over a set of parsed metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub engine_name: String,
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub success_rate: f64,

    /// Output tokens per second of wall-clock window.
    pub tokens_per_second: Option<f64>,
    pub requests_per_second: Option<f64>,
    /// Mean of the per-request decode rates.
    pub mean_response_token_rate: Option<f64>,

    pub mean_latency: Option<f64>,
    pub stddev_latency: Option<f64>,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub p50_latency: Option<f64>,
    pub p95_latency: Option<f64>,
    pub p99_latency: Option<f64>,

    pub mean_ttft: Option<f64>,
    pub p50_ttft: Option<f64>,
    pub p95_ttft: Option<f64>,
    pub p99_ttft: Option<f64>,
    /// Successful requests whose TTFT was estimated rather than observed.
    pub estimated_ttft_count: usize,

    pub total_prompt_tokens: u64,
    pub total_output_tokens: u64,
    pub mean_prompt_tokens: Option<f64>,
    pub mean_output_tokens: Option<f64>,

    pub error_types: BTreeMap<String, usize>,
    pub window_start: Option<f64>,
    pub window_end: Option<f64>,
}

impl AggregateMetrics {
    /// Statistics cover successful metrics only; counts and the error
    /// histogram cover everything.
    pub fn from_metrics<'a>(
        engine_name: &str,
        metrics: impl IntoIterator<Item = &'a ParsedMetrics>,
    ) -> Self {
        let all: Vec<&ParsedMetrics> = metrics.into_iter().collect();
        let ok: Vec<&ParsedMetrics> = all.iter().copied().filter(|m| m.success).collect();

        let total_requests = all.len();
        let successful_requests = ok.len();
        let success_rate = match total_requests {
            0 => 0.0,
            n => successful_requests as f64 / n as f64,
        };

        let mut error_types = BTreeMap::new();
        for m in all.iter().filter(|m| !m.success) {
            let key = m.error_kind.map_or("unknown", |k| k.label());
            *error_types.entry(key.to_string()).or_insert(0) += 1;
        }

        let window_start = ok.iter().map(|m| m.timestamp).reduce(f64::min);
        let window_end = ok
            .iter()
            .map(|m| m.timestamp + m.total_duration.unwrap_or(0.0))
            .reduce(f64::max);
        let window = match (window_start, window_end) {
            (Some(s), Some(e)) if e > s => Some(e - s),
            _ => None,
        };

        let latency = LatencyStats::from_sample(ok.iter().filter_map(|m| m.total_duration));
        let ttft = LatencyStats::from_sample(ok.iter().filter_map(|m| m.first_token_latency));

        let prompt_tokens: Vec<f64> =
            ok.iter().filter_map(|m| m.prompt_eval_count).map(|c| c as f64).collect();
        let output_tokens: Vec<f64> =
            ok.iter().filter_map(|m| m.eval_count).map(|c| c as f64).collect();
        let total_prompt_tokens = ok.iter().filter_map(|m| m.prompt_eval_count).sum();
        let total_output_tokens: u64 = ok.iter().filter_map(|m| m.eval_count).sum();

        let rates: Vec<f64> = ok.iter().filter_map(|m| m.response_token_rate).collect();

        let tokens_per_second = match (window, output_tokens.is_empty()) {
            (Some(w), false) => Some(total_output_tokens as f64 / w),
            _ => None,
        };
        let requests_per_second = window.map(|w| successful_requests as f64 / w);

        Self {
            engine_name: engine_name.to_string(),
            total_requests,
            successful_requests,
            failed_requests: total_requests - successful_requests,
            success_rate,
            tokens_per_second,
            requests_per_second,
            mean_response_token_rate: mean(&rates),
            mean_latency: latency.mean,
            stddev_latency: latency.stddev,
            min_latency: latency.min,
            max_latency: latency.max,
            p50_latency: latency.p50,
            p95_latency: latency.p95,
            p99_latency: latency.p99,
            mean_ttft: ttft.mean,
            p50_ttft: ttft.p50,
            p95_ttft: ttft.p95,
            p99_ttft: ttft.p99,
            estimated_ttft_count: ok.iter().filter(|m| m.ttft_is_estimated()).count(),
            total_prompt_tokens,
            total_output_tokens,
            mean_prompt_tokens: mean(&prompt_tokens),
            mean_output_tokens: mean(&output_tokens),
            error_types,
            window_start,
            window_end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineKind, ErrorKind};

    fn sample(engine: &str, ts: f64, total: f64, tokens: u64) -> ParsedMetrics {
        let mut m = ParsedMetrics::new(format!("{}-{}", engine, ts), engine, EngineKind::Ollama, "m", ts);
        m.total_duration = Some(total);
        m.eval_count = Some(tokens);
        m.eval_duration = Some(total * 0.8);
        m.derive();
        m
    }

    #[test]
    fn test_percentile_interpolation() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(percentile(&sorted, 1.0), Some(4.0));
        assert_eq!(percentile(&sorted, 0.5), Some(2.5));
        assert!((percentile(&sorted, 0.95).unwrap() - 3.85).abs() < 1e-12);
        assert_eq!(percentile(&[7.0], 0.99), Some(7.0));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn test_percentile_ordering() {
        let values = [0.9, 3.2, 0.1, 7.7, 2.2, 2.2, 5.0, 0.4, 9.9, 1.3, 4.4];
        let stats = LatencyStats::from_sample(values);
        let (min, p50, p95, p99, max) = (
            stats.min.unwrap(),
            stats.p50.unwrap(),
            stats.p95.unwrap(),
            stats.p99.unwrap(),
            stats.max.unwrap(),
        );
        assert!(min <= p50);
        assert!(p50 <= p95);
        assert!(p95 <= p99);
        assert!(p99 <= max);
    }

    #[test]
    fn test_stddev() {
        assert_eq!(stddev(&[]), None);
        assert_eq!(stddev(&[3.0]), Some(0.0));
        let sd = stddev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((sd - 2.138089935).abs() < 1e-6);
    }

    #[test]
    fn test_zero_successes_leave_stats_unset() {
        let mut failed = sample("down", 100.0, 1.0, 5);
        failed.mark_failed(ErrorKind::Connection, "refused");
        let mut timeout = sample("down", 101.0, 1.0, 5);
        timeout.mark_failed(ErrorKind::Timeout, "slow");

        let agg = AggregateMetrics::from_metrics("down", [&failed, &timeout]);
        assert_eq!(agg.total_requests, 2);
        assert_eq!(agg.failed_requests, 2);
        assert_eq!(agg.success_rate, 0.0);
        assert_eq!(agg.p50_latency, None);
        assert_eq!(agg.p95_latency, None);
        assert_eq!(agg.p99_latency, None);
        assert_eq!(agg.mean_latency, None);
        assert_eq!(agg.tokens_per_second, None);
        assert_eq!(agg.requests_per_second, None);
        assert_eq!(agg.error_types.get("connection"), Some(&1));
        assert_eq!(agg.error_types.get("timeout"), Some(&1));
    }

    #[test]
    fn test_aggregate_skips_missing_and_failed() {
        let a = sample("e", 100.0, 1.0, 10);
        let b = sample("e", 100.5, 3.0, 30);
        let mut missing = ParsedMetrics::new("x", "e", EngineKind::Ollama, "m", 101.0);
        missing.total_duration = Some(2.0);
        missing.derive();
        let mut bad = sample("e", 102.0, 50.0, 0);
        bad.mark_failed(ErrorKind::Http, "500");

        let agg = AggregateMetrics::from_metrics("e", [&a, &b, &missing, &bad]);
        assert_eq!(agg.total_requests, 4);
        assert_eq!(agg.successful_requests, 3);
        assert_eq!(agg.success_rate, 0.75);
        assert_eq!(agg.max_latency, Some(3.0));
        assert_eq!(agg.p50_latency, Some(2.0));
        assert_eq!(agg.total_output_tokens, 40);
        assert_eq!(agg.mean_output_tokens, Some(20.0));
        assert_eq!(agg.window_start, Some(100.0));
        assert_eq!(agg.window_end, Some(103.5));
        assert_eq!(agg.tokens_per_second, Some(40.0 / 3.5));
        assert_eq!(agg.requests_per_second, Some(3.0 / 3.5));
        assert_eq!(agg.estimated_ttft_count, 3);
    }
}
