use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use enginebench_core::metrics::unix_now;
use enginebench_core::{
    AggregateMetrics, CollectionSummary, EngineError, ErrorKind, MetricsCollection,
    ParsedMetrics, RequestOptions, RequestResult, Result, TokenEvent,
};
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapter::EngineAdapter;
use crate::export::{self, ExportFormat, ExportSelection};
use crate::registry::ConnectionRegistry;

const TOKEN_CHANNEL_CAPACITY: usize = 256;

/// One entry of a `collect_concurrent` batch.
#[derive(Debug, Clone)]
pub struct ConcurrentRequest {
    pub backend: String,
    pub prompt: String,
    pub model: String,
    pub stream: bool,
    pub options: RequestOptions,
}

impl ConcurrentRequest {
    pub fn new(backend: impl Into<String>, prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            prompt: prompt.into(),
            model: model.into(),
            stream: false,
            options: RequestOptions::default(),
        }
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// Executes requests through the registry and accumulates their metrics into
/// the active collection.
pub struct MetricsCollector {
    registry: Arc<ConnectionRegistry>,
    current: Mutex<Option<MetricsCollection>>,
}

impl MetricsCollector {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            current: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Begin a new collection, replacing any current one. Returns its id.
    pub fn start_collection(&self, description: Option<String>) -> String {
        let collection = MetricsCollection::new(description);
        let id = collection.collection_id.clone();

        if let Some(previous) = self.lock().replace(collection) {
            warn!(
                previous = %previous.collection_id,
                parsed = previous.parsed_metrics.len(),
                "Replacing unfinished collection"
            );
        }
        info!(collection_id = %id, "Started metrics collection");
        id
    }

    pub fn has_active_collection(&self) -> bool {
        self.lock().is_some()
    }

    #[instrument(skip(self, prompt, options))]
    pub async fn collect_single(
        &self,
        backend: &str,
        prompt: &str,
        model: &str,
        options: &RequestOptions,
    ) -> Result<RequestResult> {
        self.ensure_active()?;
        let adapter = self.registry.get(backend)?;

        let started_at = unix_now();
        let start = Instant::now();
        let result = match adapter.send_single_request(prompt, model, options).await {
            Ok(result) => result,
            Err(e) => {
                warn!(engine = backend, "Request failed: {}", e);
                failed_result(adapter.as_ref(), model, e.kind(), e.to_string(), started_at, start.elapsed())
            }
        };

        self.record(&result)?;
        Ok(result)
    }

    /// Streaming request. Token events are forwarded in order to `tokens`
    /// when given; the first event's timestamp becomes the measured TTFT.
    #[instrument(skip(self, prompt, tokens, options))]
    pub async fn collect_streaming(
        &self,
        backend: &str,
        prompt: &str,
        model: &str,
        tokens: Option<mpsc::Sender<TokenEvent>>,
        options: &RequestOptions,
    ) -> Result<RequestResult> {
        self.ensure_active()?;
        let adapter = self.registry.get(backend)?;

        let (tx, mut rx) = mpsc::channel::<TokenEvent>(TOKEN_CHANNEL_CAPACITY);
        let started_at = unix_now();
        let start = Instant::now();

        let request = adapter.send_streaming_request(prompt, model, tx, options);
        let forward = async move {
            let mut first: Option<Duration> = None;
            let mut out = tokens;
            while let Some(event) = rx.recv().await {
                first.get_or_insert(event.elapsed);
                let Some(sender) = &out else { continue };
                if sender.send(event).await.is_err() {
                    debug!("Caller dropped token receiver");
                    out = None;
                }
            }
            first
        };

        let (outcome, first) = tokio::join!(request, forward);

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(engine = backend, "Streaming request failed: {}", e);
                failed_result(adapter.as_ref(), model, e.kind(), e.to_string(), started_at, start.elapsed())
            }
        };

        if let Some(first) = first.map(|d| d.as_secs_f64()) {
            if let Some(parsed) = result.parsed_metrics.as_mut().filter(|p| p.success) {
                parsed.record_first_token(first);
                parsed.derive();
            }
            if let Some(raw) = result.raw_metrics.as_mut() {
                raw.first_token_time.get_or_insert(first);
            }
        }

        self.record(&result)?;
        Ok(result)
    }

    /// Run a batch with at most `max_concurrency` requests in flight.
    ///
    /// Results come back in input order. Failures, panics included, become a
    /// failed result at their own index and never affect siblings.
    pub async fn collect_concurrent(
        &self,
        requests: Vec<ConcurrentRequest>,
        max_concurrency: usize,
    ) -> Result<Vec<RequestResult>> {
        self.ensure_active()?;
        info!(count = requests.len(), max_concurrency, "Running concurrent batch");

        let semaphore = Semaphore::new(max_concurrency.max(1));
        let semaphore = &semaphore;

        let tasks = requests.iter().map(|req| async move {
            let _permit = semaphore.acquire().await.ok();
            let started_at = unix_now();
            let start = Instant::now();

            match AssertUnwindSafe(self.run_request(req)).catch_unwind().await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!(engine = %req.backend, "Batch request rejected: {}", e);
                    RequestResult::failed(e.to_string())
                }
                Err(panic) => {
                    let message = format!("request panicked: {}", panic_message(panic));
                    error!(engine = %req.backend, "{}", message);
                    self.record_failure(&req.backend, &req.model, ErrorKind::Internal, message, started_at, start.elapsed())
                }
            }
        });

        Ok(join_all(tasks).await)
    }

    async fn run_request(&self, req: &ConcurrentRequest) -> Result<RequestResult> {
        match req.stream {
            true => {
                self.collect_streaming(&req.backend, &req.prompt, &req.model, None, &req.options)
                    .await
            }
            false => {
                self.collect_single(&req.backend, &req.prompt, &req.model, &req.options)
                    .await
            }
        }
    }

    /// Append a failed metric for a request that never produced a result,
    /// such as one that panicked. Falls back to a bare failed result when the
    /// backend is gone or no collection is active.
    pub(crate) fn record_failure(
        &self,
        backend: &str,
        model: &str,
        kind: ErrorKind,
        message: String,
        started_at: f64,
        elapsed: Duration,
    ) -> RequestResult {
        let Ok(adapter) = self.registry.get(backend) else {
            return RequestResult::failed(message);
        };
        let result = failed_result(adapter.as_ref(), model, kind, message.clone(), started_at, elapsed);
        match self.record(&result) {
            Ok(()) => result,
            Err(_) => RequestResult::failed(message),
        }
    }

    /// Aggregate parsed metrics per backend, optionally for one backend only.
    /// The aggregates are appended to the collection and returned.
    pub fn aggregate(&self, backend: Option<&str>) -> Result<Vec<AggregateMetrics>> {
        let mut guard = self.lock();
        let collection = guard.as_mut().ok_or(EngineError::NoActiveCollection)?;

        let mut groups: BTreeMap<&str, Vec<&ParsedMetrics>> = BTreeMap::new();
        for metrics in &collection.parsed_metrics {
            if backend.is_some_and(|b| b != metrics.engine_name) {
                continue;
            }
            groups.entry(metrics.engine_name.as_str()).or_default().push(metrics);
        }

        let aggregates: Vec<AggregateMetrics> = groups
            .into_iter()
            .map(|(engine, metrics)| AggregateMetrics::from_metrics(engine, metrics))
            .collect();

        for agg in &aggregates {
            info!(
                engine = %agg.engine_name,
                total = agg.total_requests,
                success_rate = agg.success_rate,
                p95 = ?agg.p95_latency,
                "Aggregated metrics"
            );
        }

        collection.aggregate_metrics.extend(aggregates.iter().cloned());
        Ok(aggregates)
    }

    /// Write the current collection to `path`. The snapshot is taken under
    /// the lock; the file is written outside it.
    pub fn export(
        &self,
        path: impl AsRef<Path>,
        format: ExportFormat,
        selection: ExportSelection,
    ) -> Result<()> {
        let collection = self.snapshot()?;
        export::write_collection(&collection, path.as_ref(), format, selection)
    }

    /// Drop the current collection, returning it.
    pub fn clear_collection(&self) -> Option<MetricsCollection> {
        let cleared = self.lock().take();
        if let Some(collection) = &cleared {
            info!(collection_id = %collection.collection_id, "Cleared metrics collection");
        }
        cleared
    }

    pub fn summary(&self) -> Result<CollectionSummary> {
        self.lock()
            .as_ref()
            .map(MetricsCollection::summary)
            .ok_or(EngineError::NoActiveCollection)
    }

    pub fn snapshot(&self) -> Result<MetricsCollection> {
        self.lock().clone().ok_or(EngineError::NoActiveCollection)
    }

    fn ensure_active(&self) -> Result<()> {
        match self.has_active_collection() {
            true => Ok(()),
            false => Err(EngineError::NoActiveCollection),
        }
    }

    fn record(&self, result: &RequestResult) -> Result<()> {
        let mut guard = self.lock();
        let collection = guard.as_mut().ok_or(EngineError::NoActiveCollection)?;
        if let Some(raw) = &result.raw_metrics {
            collection.raw_metrics.push(raw.clone());
        }
        if let Some(parsed) = &result.parsed_metrics {
            collection.parsed_metrics.push(parsed.clone());
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Option<MetricsCollection>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A request that produced no usable response: failed metrics, no raw capture.
fn failed_result(
    adapter: &dyn EngineAdapter,
    model: &str,
    kind: ErrorKind,
    message: String,
    started_at: f64,
    elapsed: Duration,
) -> RequestResult {
    let mut parsed = ParsedMetrics::new(
        Uuid::new_v4().to_string(),
        adapter.name(),
        adapter.kind(),
        model,
        started_at,
    );
    parsed.total_duration = Some(elapsed.as_secs_f64());
    parsed.mark_failed(kind, message.clone());
    parsed.derive();

    RequestResult {
        success: false,
        response_text: String::new(),
        error_message: Some(message),
        raw_metrics: None,
        parsed_metrics: Some(parsed),
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return s.to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}
