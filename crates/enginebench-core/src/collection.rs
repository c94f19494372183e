use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics::unix_now;
use crate::{AggregateMetrics, ParsedMetrics, RawMetrics};

/// One benchmarking session's accumulated metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsCollection {
    pub collection_id: String,
    pub created_at: f64,
    #[serde(default)]
    pub description: Option<String>,
    pub raw_metrics: Vec<RawMetrics>,
    pub parsed_metrics: Vec<ParsedMetrics>,
    pub aggregate_metrics: Vec<AggregateMetrics>,
}

impl MetricsCollection {
    pub fn new(description: Option<String>) -> Self {
        Self {
            collection_id: Uuid::new_v4().to_string(),
            created_at: unix_now(),
            description,
            raw_metrics: Vec::new(),
            parsed_metrics: Vec::new(),
            aggregate_metrics: Vec::new(),
        }
    }

    pub fn summary(&self) -> CollectionSummary {
        let successful = self.parsed_metrics.iter().filter(|m| m.success).count();
        let total = self.parsed_metrics.len();
        let engines: BTreeSet<&str> = self
            .parsed_metrics
            .iter()
            .map(|m| m.engine_name.as_str())
            .collect();

        CollectionSummary {
            collection_id: self.collection_id.clone(),
            created_at: self.created_at,
            description: self.description.clone(),
            total_raw_metrics: self.raw_metrics.len(),
            total_parsed_metrics: total,
            total_aggregate_metrics: self.aggregate_metrics.len(),
            successful_requests: successful,
            failed_requests: total - successful,
            success_rate: match total {
                0 => 0.0,
                n => successful as f64 / n as f64,
            },
            engines: engines.into_iter().map(String::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub collection_id: String,
    pub created_at: f64,
    #[serde(default)]
    pub description: Option<String>,
    pub total_raw_metrics: usize,
    pub total_parsed_metrics: usize,
    pub total_aggregate_metrics: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub success_rate: f64,
    pub engines: Vec<String>,
}

/// On-disk JSON export layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionExport {
    pub collection_info: CollectionSummary,
    pub export_timestamp: f64,
    #[serde(default)]
    pub raw_metrics: Vec<RawMetrics>,
    #[serde(default)]
    pub parsed_metrics: Vec<ParsedMetrics>,
    #[serde(default)]
    pub aggregate_metrics: Vec<AggregateMetrics>,
}
