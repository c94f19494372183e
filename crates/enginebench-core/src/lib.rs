pub mod aggregate;
pub mod collection;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod request;

pub use aggregate::{AggregateMetrics, LatencyStats};
pub use collection::{CollectionExport, CollectionSummary, MetricsCollection};
pub use config::{BackendConfig, EngineBenchConfig, EngineKind, LoadDefaults, RetryPolicy};
pub use engine::{EngineCapabilities, EngineInfo, HealthStatus, ModelInfo};
pub use error::{EngineError, ErrorKind, Result};
pub use metrics::{ParsedMetrics, RawMetrics, TtftSource};
pub use request::{RequestOptions, RequestResult, TokenEvent};
