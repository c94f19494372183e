use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metrics::unix_now;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub engine_name: String,
    pub healthy: bool,
    /// Probe round trip in seconds.
    pub response_time: f64,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub diagnostics: BTreeMap<String, serde_json::Value>,
    pub checked_at: f64,
}

impl HealthStatus {
    pub fn healthy(engine_name: impl Into<String>, response_time: f64) -> Self {
        Self {
            engine_name: engine_name.into(),
            healthy: true,
            response_time,
            version: None,
            error: None,
            diagnostics: BTreeMap::new(),
            checked_at: unix_now(),
        }
    }

    pub fn unhealthy(engine_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            engine_name: engine_name.into(),
            healthy: false,
            response_time: 0.0,
            version: None,
            error: Some(error.into()),
            diagnostics: BTreeMap::new(),
            checked_at: unix_now(),
        }
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineCapabilities {
    pub streaming: bool,
    /// Backend reports its own server-side timing.
    pub native_timing: bool,
    pub model_listing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineInfo {
    pub engine_name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub capabilities: EngineCapabilities,
    #[serde(default)]
    pub features: Vec<String>,
    pub model_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub parameter_size: Option<String>,
    #[serde(default)]
    pub quantization: Option<String>,
    pub available: bool,
}

impl ModelInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            family: None,
            size_bytes: None,
            parameter_size: None,
            quantization: None,
            available: true,
        }
    }
}
