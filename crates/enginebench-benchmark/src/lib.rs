pub mod adapter;
pub mod adapters;
pub mod collector;
pub mod export;
pub mod registry;
pub mod runner;

#[cfg(test)]
pub(crate) mod mock;

pub use adapter::{AdapterFactory, EngineAdapter, RawResponse, TimingHints};
pub use adapters::{HttpAdapterFactory, OllamaAdapter, TgiAdapter, VllmAdapter};
pub use collector::{ConcurrentRequest, MetricsCollector};
pub use export::{ExportFormat, ExportSelection};
pub use registry::ConnectionRegistry;
pub use runner::{
    select_winner, BackendLoadResult, BenchmarkRunner, LiveStats, LoadEvent, LoadTarget,
    LoadTestConfig, LoadTestReport, RunMode,
};
