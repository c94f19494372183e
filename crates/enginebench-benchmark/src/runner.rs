use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use enginebench_core::metrics::unix_now;
use enginebench_core::{EngineError, ErrorKind, LatencyStats, LoadDefaults, RequestOptions, RequestResult, Result};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::{panic_message, MetricsCollector};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// All backends under load at the same time.
    #[default]
    Simultaneous,
    /// One backend after another.
    Sequential,
}

#[derive(Debug, Clone)]
pub struct LoadTestConfig {
    pub concurrent_users: u32,
    pub duration: Duration,
    pub prompts: Vec<String>,
    /// Stream every request so TTFT is measured rather than estimated.
    pub capture_ttft: bool,
    pub request_delay: Duration,
    pub mode: RunMode,
    pub options: RequestOptions,
}

impl LoadTestConfig {
    pub fn from_defaults(defaults: &LoadDefaults, prompts: Vec<String>) -> Self {
        Self {
            concurrent_users: defaults.concurrent_users,
            duration: Duration::from_secs(defaults.duration_secs),
            prompts,
            capture_ttft: false,
            request_delay: Duration::from_millis(defaults.request_delay_ms),
            mode: RunMode::default(),
            options: RequestOptions::default(),
        }
    }

    fn validate(&self, targets: &[LoadTarget]) -> Result<()> {
        if targets.is_empty() {
            return Err(EngineError::Config("load test needs at least one backend".into()));
        }
        if self.prompts.is_empty() {
            return Err(EngineError::Config("load test needs at least one prompt".into()));
        }
        if self.concurrent_users == 0 {
            return Err(EngineError::Config("concurrent_users must be at least 1".into()));
        }
        let distinct: BTreeSet<&str> = targets.iter().map(|t| t.backend.as_str()).collect();
        if distinct.len() != targets.len() {
            return Err(EngineError::Config("each backend may appear only once per load test".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTarget {
    pub backend: String,
    pub model: String,
}

impl LoadTarget {
    pub fn new(backend: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoadEvent {
    Started {
        backend: String,
        users: u32,
        duration_secs: f64,
    },
    RequestComplete {
        backend: String,
        user: u32,
        success: bool,
        response_time: Option<f64>,
        ttft: Option<f64>,
        tokens: Option<u64>,
    },
    BackendComplete {
        result: BackendLoadResult,
    },
    Finished {
        winner: Option<String>,
        cancelled: bool,
    },
}

/// Running totals for one backend, updated after every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub response_times: Vec<f64>,
    pub ttfts: Vec<f64>,
    pub output_tokens: u64,
    pub errors: Vec<String>,
}

impl LiveStats {
    fn record(&mut self, sample: &Sample) {
        self.total_requests += 1;
        match &sample.error {
            None => {
                self.successful_requests += 1;
                self.response_times.extend(sample.response_time);
                self.ttfts.extend(sample.ttft);
                self.output_tokens += sample.tokens.unwrap_or(0);
            }
            Some(err) => {
                self.failed_requests += 1;
                self.errors.push(err.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendLoadResult {
    pub backend: String,
    pub model: String,
    pub concurrent_users: u32,
    pub started_at: f64,
    pub finished_at: f64,
    pub wall_clock_secs: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub requests_per_second: f64,
    pub tokens_per_second: Option<f64>,
    pub response_time: LatencyStats,
    pub ttft: LatencyStats,
    pub errors: Vec<String>,
}

impl BackendLoadResult {
    fn finalize(target: &LoadTarget, users: u32, started_at: f64, wall: Duration, stats: LiveStats) -> Self {
        let wall_clock_secs = wall.as_secs_f64();
        let per_second = |count: u64| match wall_clock_secs > 0.0 {
            true => count as f64 / wall_clock_secs,
            false => 0.0,
        };

        Self {
            backend: target.backend.clone(),
            model: target.model.clone(),
            concurrent_users: users,
            started_at,
            finished_at: started_at + wall_clock_secs,
            wall_clock_secs,
            total_requests: stats.total_requests,
            successful_requests: stats.successful_requests,
            failed_requests: stats.failed_requests,
            success_rate: match stats.total_requests {
                0 => 0.0,
                n => stats.successful_requests as f64 / n as f64,
            },
            requests_per_second: per_second(stats.total_requests),
            tokens_per_second: (stats.output_tokens > 0).then(|| per_second(stats.output_tokens)),
            response_time: LatencyStats::from_sample(stats.response_times),
            ttft: LatencyStats::from_sample(stats.ttfts),
            errors: stats.errors,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadTestReport {
    pub collection_id: String,
    pub mode: RunMode,
    pub duration_secs: f64,
    pub concurrent_users: u32,
    pub results: Vec<BackendLoadResult>,
    pub winner: Option<String>,
    pub cancelled: bool,
}

/// Lowest p95 response time among backends with at least one success.
pub fn select_winner(results: &[BackendLoadResult]) -> Option<String> {
    results
        .iter()
        .filter(|r| r.successful_requests > 0)
        .filter_map(|r| r.response_time.p95.map(|p95| (r, p95)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(r, _)| r.backend.clone())
}

/// One finished request as seen by a virtual user.
struct Sample {
    response_time: Option<f64>,
    ttft: Option<f64>,
    tokens: Option<u64>,
    error: Option<String>,
}

impl Sample {
    fn from_result(result: &RequestResult, elapsed: Duration) -> Self {
        let error = match result.success {
            true => None,
            false => Some(result.error_message.clone().unwrap_or_else(|| "request failed".into())),
        };
        Self {
            response_time: Some(result.total_duration().unwrap_or(elapsed.as_secs_f64())),
            ttft: result.first_token_latency(),
            tokens: result.output_tokens(),
            error,
        }
    }

    fn failure(message: String) -> Self {
        Self {
            response_time: None,
            ttft: None,
            tokens: None,
            error: Some(message),
        }
    }
}

/// Everything a virtual user task needs, shared across the users of one backend.
struct UserContext {
    collector: Arc<MetricsCollector>,
    live: Arc<DashMap<String, LiveStats>>,
    target: LoadTarget,
    config: LoadTestConfig,
    next_prompt: AtomicUsize,
    end: Instant,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<LoadEvent>>,
}

impl UserContext {
    async fn send_request(&self, prompt: &str) -> Result<RequestResult> {
        let target = &self.target;
        match self.config.capture_ttft {
            true => {
                self.collector
                    .collect_streaming(&target.backend, prompt, &target.model, None, &self.config.options)
                    .await
            }
            false => {
                self.collector
                    .collect_single(&target.backend, prompt, &target.model, &self.config.options)
                    .await
            }
        }
    }

    fn record_failure(&self, kind: ErrorKind, message: String, started_at: f64, elapsed: Duration) {
        self.collector.record_failure(
            &self.target.backend,
            &self.target.model,
            kind,
            message,
            started_at,
            elapsed,
        );
    }

    fn record(&self, sample: &Sample) {
        self.live
            .entry(self.target.backend.clone())
            .or_default()
            .record(sample);
    }

    async fn emit(&self, event: LoadEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

/// Sequential request loop of one virtual user. Always issues at least one
/// request; the end time is checked after the inter-request delay.
async fn virtual_user(ctx: Arc<UserContext>, user: u32) {
    let prompts = &ctx.config.prompts;
    loop {
        let prompt = &prompts[ctx.next_prompt.fetch_add(1, Ordering::Relaxed) % prompts.len()];
        let started_at = unix_now();
        let start = Instant::now();

        let sample = match AssertUnwindSafe(ctx.send_request(prompt)).catch_unwind().await {
            Ok(Ok(result)) => Sample::from_result(&result, start.elapsed()),
            Ok(Err(e)) => {
                ctx.record_failure(e.kind(), e.to_string(), started_at, start.elapsed());
                Sample::failure(e.to_string())
            }
            Err(panic) => {
                let message = format!("virtual user {} panicked during a request: {}", user, panic_message(panic));
                ctx.record_failure(ErrorKind::Internal, message.clone(), started_at, start.elapsed());
                Sample::failure(message)
            }
        };
        if let Some(err) = &sample.error {
            debug!(backend = %ctx.target.backend, user, "Request failed: {}", err);
        }
        ctx.record(&sample);
        ctx.emit(LoadEvent::RequestComplete {
            backend: ctx.target.backend.clone(),
            user,
            success: sample.error.is_none(),
            response_time: sample.response_time,
            ttft: sample.ttft,
            tokens: sample.tokens,
        })
        .await;

        if ctx.cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(ctx.config.request_delay) => {}
        }
        if Instant::now() >= ctx.end {
            break;
        }
    }
}

/// Time-windowed multi-user load against registered backends.
pub struct BenchmarkRunner {
    collector: Arc<MetricsCollector>,
    live: Arc<DashMap<String, LiveStats>>,
}

impl BenchmarkRunner {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self {
            collector,
            live: Arc::new(DashMap::new()),
        }
    }

    /// Snapshot of the running totals for one backend.
    pub fn live_stats(&self, backend: &str) -> Option<LiveStats> {
        self.live.get(backend).map(|s| s.value().clone())
    }

    pub async fn run(
        &self,
        targets: &[LoadTarget],
        config: &LoadTestConfig,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<LoadEvent>>,
    ) -> Result<LoadTestReport> {
        config.validate(targets)?;
        for target in targets {
            self.collector.registry().get(&target.backend)?;
        }

        if !self.collector.has_active_collection() {
            self.collector
                .start_collection(Some(format!("load test: {} backend(s)", targets.len())));
        }
        let collection_id = self.collector.summary()?.collection_id;

        info!(
            backends = targets.len(),
            users = config.concurrent_users,
            duration_secs = config.duration.as_secs_f64(),
            mode = ?config.mode,
            "Starting load test"
        );

        let results = match config.mode {
            RunMode::Simultaneous => {
                let runs = targets
                    .iter()
                    .map(|t| self.run_backend(t, config, &cancel, events.clone()));
                join_all(runs).await
            }
            RunMode::Sequential => {
                let mut results = Vec::with_capacity(targets.len());
                for target in targets {
                    if cancel.is_cancelled() {
                        warn!(backend = %target.backend, "Cancelled before start, skipping");
                        continue;
                    }
                    results.push(self.run_backend(target, config, &cancel, events.clone()).await);
                }
                results
            }
        };

        let winner = select_winner(&results);
        let cancelled = cancel.is_cancelled();
        info!(winner = ?winner, cancelled, "Load test finished");

        if let Some(tx) = &events {
            let _ = tx
                .send(LoadEvent::Finished {
                    winner: winner.clone(),
                    cancelled,
                })
                .await;
        }

        Ok(LoadTestReport {
            collection_id,
            mode: config.mode,
            duration_secs: config.duration.as_secs_f64(),
            concurrent_users: config.concurrent_users,
            results,
            winner,
            cancelled,
        })
    }

    async fn run_backend(
        &self,
        target: &LoadTarget,
        config: &LoadTestConfig,
        cancel: &CancellationToken,
        events: Option<mpsc::Sender<LoadEvent>>,
    ) -> BackendLoadResult {
        self.live.insert(target.backend.clone(), LiveStats::default());

        let started_at = unix_now();
        let start = Instant::now();
        let ctx = Arc::new(UserContext {
            collector: Arc::clone(&self.collector),
            live: Arc::clone(&self.live),
            target: target.clone(),
            config: config.clone(),
            next_prompt: AtomicUsize::new(0),
            end: start + config.duration,
            cancel: cancel.clone(),
            events,
        });

        ctx.emit(LoadEvent::Started {
            backend: target.backend.clone(),
            users: config.concurrent_users,
            duration_secs: config.duration.as_secs_f64(),
        })
        .await;
        info!(backend = %target.backend, users = config.concurrent_users, "Backend load started");

        let users: Vec<_> = (0..config.concurrent_users)
            .map(|user| tokio::spawn(virtual_user(Arc::clone(&ctx), user)))
            .collect();

        for (user, outcome) in join_all(users).await.into_iter().enumerate() {
            if let Err(e) = outcome {
                warn!(backend = %target.backend, user, "Virtual user aborted: {}", e);
                let message = format!("virtual user {} aborted: {}", user, e);
                ctx.record_failure(ErrorKind::Internal, message.clone(), unix_now(), Duration::ZERO);
                ctx.record(&Sample::failure(message));
            }
        }

        let stats = self.live_stats(&target.backend).unwrap_or_default();
        let result = BackendLoadResult::finalize(
            target,
            config.concurrent_users,
            started_at,
            start.elapsed(),
            stats,
        );

        info!(
            backend = %result.backend,
            total = result.total_requests,
            failed = result.failed_requests,
            p95 = ?result.response_time.p95,
            "Backend load complete"
        );
        ctx.emit(LoadEvent::BackendComplete {
            result: result.clone(),
        })
        .await;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterFactory;
    use crate::mock::MockFactory;
    use crate::registry::ConnectionRegistry;
    use enginebench_core::{BackendConfig, EngineKind};

    async fn runner(names: &[&str]) -> (Arc<MetricsCollector>, BenchmarkRunner) {
        let factory = Arc::new(MockFactory::with_latency(Duration::from_millis(50)));
        let registry = ConnectionRegistry::with_factory(
            Duration::from_secs(300),
            factory as Arc<dyn AdapterFactory>,
        );
        let configs = names
            .iter()
            .map(|n| BackendConfig::new(*n, EngineKind::Tgi, "http://localhost:8080"))
            .collect();
        registry.register_all(configs).await;
        let collector = Arc::new(MetricsCollector::new(Arc::new(registry)));
        (Arc::clone(&collector), BenchmarkRunner::new(collector))
    }

    fn config(users: u32, secs: u64, prompts: &[&str]) -> LoadTestConfig {
        LoadTestConfig {
            concurrent_users: users,
            duration: Duration::from_secs(secs),
            prompts: prompts.iter().map(|p| p.to_string()).collect(),
            capture_ttft: false,
            request_delay: Duration::from_millis(100),
            mode: RunMode::Simultaneous,
            options: RequestOptions::default(),
        }
    }

    fn result(backend: &str, successes: u64, latencies: &[f64]) -> BackendLoadResult {
        BackendLoadResult {
            backend: backend.into(),
            model: "m".into(),
            concurrent_users: 1,
            started_at: 0.0,
            finished_at: 1.0,
            wall_clock_secs: 1.0,
            total_requests: successes,
            successful_requests: successes,
            failed_requests: 0,
            success_rate: 1.0,
            requests_per_second: successes as f64,
            tokens_per_second: None,
            response_time: LatencyStats::from_sample(latencies.iter().copied()),
            ttft: LatencyStats::default(),
            errors: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_for_window_with_every_user() {
        let (collector, runner) = runner(&["a"]).await;
        let cfg = config(3, 1, &["one", "two"]);

        let report = runner
            .run(&[LoadTarget::new("a", "m")], &cfg, CancellationToken::new(), None)
            .await
            .unwrap();

        let a = &report.results[0];
        assert!(a.total_requests >= 3);
        assert!(a.wall_clock_secs >= 1.0);
        assert_eq!(a.failed_requests, 0);
        assert_eq!(a.success_rate, 1.0);
        assert!(a.response_time.p50 <= a.response_time.p95);
        assert_eq!(report.winner.as_deref(), Some("a"));
        assert!(!report.cancelled);

        let summary = collector.summary().unwrap();
        assert_eq!(summary.collection_id, report.collection_id);
        assert_eq!(summary.total_parsed_metrics as u64, a.total_requests);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_panics_do_not_abort_users() {
        let (collector, runner) = runner(&["a"]).await;
        let cfg = config(2, 1, &["fine", "refused", "please panic"]);

        let report = runner
            .run(&[LoadTarget::new("a", "m")], &cfg, CancellationToken::new(), None)
            .await
            .unwrap();

        let a = &report.results[0];
        assert!(a.successful_requests > 0);
        assert!(a.failed_requests >= 2);
        assert_eq!(a.total_requests, a.successful_requests + a.failed_requests);
        assert!(a.errors.iter().any(|e| e.contains("refused")));
        assert!(a.errors.iter().any(|e| e.contains("panicked")));
        assert!(a.wall_clock_secs >= 1.0);

        let summary = collector.summary().unwrap();
        assert_eq!(summary.total_parsed_metrics as u64, a.total_requests);
        let aggregates = collector.aggregate(Some("a")).unwrap();
        assert!(aggregates[0].error_types.get("internal").is_some_and(|n| *n > 0));
        assert!(aggregates[0].error_types.contains_key("connection"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_that_always_panics_still_aggregates() {
        let (collector, runner) = runner(&["a"]).await;

        let report = runner
            .run(&[LoadTarget::new("a", "m")], &config(2, 1, &["please panic"]), CancellationToken::new(), None)
            .await
            .unwrap();

        let a = &report.results[0];
        assert_eq!(a.successful_requests, 0);
        assert_eq!(a.failed_requests, a.total_requests);

        let aggregates = collector.aggregate(None).unwrap();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].engine_name, "a");
        assert_eq!(aggregates[0].success_rate, 0.0);
        assert_eq!(aggregates[0].error_types.get("internal").copied(), Some(a.total_requests as usize));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_still_issues_one_request_per_user() {
        let (_, runner) = runner(&["a"]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = runner
            .run(&[LoadTarget::new("a", "m")], &config(4, 60, &["hi"]), cancel, None)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.results[0].total_requests, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_mode_runs_backends_in_turn() {
        let (_, runner) = runner(&["a", "b"]).await;
        let mut cfg = config(1, 1, &["hi"]);
        cfg.mode = RunMode::Sequential;
        cfg.capture_ttft = true;

        let start = Instant::now();
        let report = runner
            .run(
                &[LoadTarget::new("a", "m"), LoadTarget::new("b", "m")],
                &cfg,
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(report.results.len(), 2);
        for r in &report.results {
            assert!(r.wall_clock_secs >= 1.0);
            assert_eq!(r.ttft.p50.map(|t| (t * 1000.0).round()), Some(50.0));
        }
        assert!(runner.live_stats("b").unwrap().total_requests >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_emitted_in_order() {
        let (_, runner) = runner(&["a"]).await;
        let (tx, mut rx) = mpsc::channel(16);
        let drain = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        });

        runner
            .run(&[LoadTarget::new("a", "m")], &config(1, 1, &["hi"]), CancellationToken::new(), Some(tx))
            .await
            .unwrap();
        let events = drain.await.unwrap();

        assert!(matches!(events.first(), Some(LoadEvent::Started { .. })));
        assert!(matches!(events[events.len() - 2], LoadEvent::BackendComplete { .. }));
        assert!(matches!(events.last(), Some(LoadEvent::Finished { winner: Some(_), .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, LoadEvent::RequestComplete { success: true, .. })));
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let (_, runner) = runner(&["a"]).await;
        let cancel = CancellationToken::new();
        let target = [LoadTarget::new("a", "m")];

        let err = runner.run(&target, &config(1, 1, &[]), cancel.clone(), None).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let err = runner.run(&target, &config(0, 1, &["p"]), cancel.clone(), None).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let twice = [LoadTarget::new("a", "m"), LoadTarget::new("a", "m")];
        let err = runner.run(&twice, &config(1, 1, &["p"]), cancel.clone(), None).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let err = runner
            .run(&[LoadTarget::new("zzz", "m")], &config(1, 1, &["p"]), cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EngineNotFound(_)));
    }

    #[test]
    fn test_winner_is_lowest_p95_with_successes() {
        let results = vec![
            result("slow", 10, &[1.0, 2.0, 3.0]),
            result("fast", 10, &[0.2, 0.3, 0.4]),
            result("empty", 0, &[]),
        ];
        assert_eq!(select_winner(&results).as_deref(), Some("fast"));
        assert_eq!(select_winner(&[result("empty", 0, &[])]), None);
        assert_eq!(select_winner(&[]), None);
    }
}
