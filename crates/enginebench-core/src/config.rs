use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{EngineError, Result};

/// Wire protocol spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Ollama,
    Vllm,
    Tgi,
}

impl EngineKind {
    pub fn label(&self) -> &'static str {
        match self {
            EngineKind::Ollama => "ollama",
            EngineKind::Vllm => "vllm",
            EngineKind::Tgi => "tgi",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            EngineKind::Ollama => "http://localhost:11434",
            EngineKind::Vllm => "http://localhost:8000",
            EngineKind::Tgi => "http://localhost:8080",
        }
    }

    /// Share of total duration assumed to precede the first token when the
    /// backend reports no timing that covers it.
    pub fn ttft_fallback_ratio(&self) -> f64 {
        match self {
            EngineKind::Ollama => 0.10,
            EngineKind::Vllm => 0.25,
            EngineKind::Tgi => 0.15,
        }
    }

    pub fn all() -> &'static [EngineKind] {
        &[EngineKind::Ollama, EngineKind::Vllm, EngineKind::Tgi]
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EngineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(EngineKind::Ollama),
            "vllm" => Ok(EngineKind::Vllm),
            "tgi" | "text-generation-inference" => Ok(EngineKind::Tgi),
            other => Err(EngineError::Config(format!("Unknown engine kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry that follows `attempt` (zero-based): base * 2^attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub kind: EngineKind,
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub default_model: Option<String>,
}

fn default_timeout_secs() -> u64 {
    300
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, kind: EngineKind, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            base_url: base_url.into(),
            timeout_secs: default_timeout_secs(),
            retry: RetryPolicy::default(),
            auth_token: None,
            headers: BTreeMap::new(),
            default_model: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Base URL without a trailing slash, ready for `format!("{}/path", ..)`.
    pub fn endpoint(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("Engine name must not be empty".into()));
        }

        let rest = self
            .base_url
            .strip_prefix("http://")
            .or_else(|| self.base_url.strip_prefix("https://"))
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "{}: base_url must start with http:// or https://, got '{}'",
                    self.name, self.base_url
                ))
            })?;

        if rest.trim_matches('/').is_empty() {
            return Err(EngineError::Config(format!("{}: base_url has no host", self.name)));
        }

        if self.timeout_secs == 0 {
            return Err(EngineError::Config(format!("{}: timeout must be > 0", self.name)));
        }

        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config(format!(
                "{}: retry.max_attempts must be >= 1",
                self.name
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadDefaults {
    pub concurrent_users: u32,
    pub duration_secs: u64,
    pub request_delay_ms: u64,
}

impl Default for LoadDefaults {
    fn default() -> Self {
        Self {
            concurrent_users: 4,
            duration_secs: 60,
            request_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineBenchConfig {
    #[serde(default)]
    pub engines: Vec<BackendConfig>,
    #[serde(default = "default_health_ttl_secs")]
    pub health_cache_ttl_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub load: LoadDefaults,
}

fn default_health_ttl_secs() -> u64 {
    300
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for EngineBenchConfig {
    fn default() -> Self {
        Self {
            engines: Vec::new(),
            health_cache_ttl_secs: default_health_ttl_secs(),
            max_concurrency: default_max_concurrency(),
            load: LoadDefaults::default(),
        }
    }
}

impl EngineBenchConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Engines declared through `OLLAMA_HOST`, `VLLM_HOST` and `TGI_HOST`,
    /// plus a TTL override from `ENGINEBENCH_HEALTH_TTL_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let hosts = [
            ("OLLAMA_HOST", EngineKind::Ollama),
            ("VLLM_HOST", EngineKind::Vllm),
            ("TGI_HOST", EngineKind::Tgi),
        ];

        for (key, kind) in hosts {
            let Some(url) = lookup(key) else { continue };
            if self.engines.iter().any(|e| e.name == kind.label()) {
                continue;
            }
            self.engines.push(BackendConfig::new(kind.label(), kind, url));
        }

        if let Some(ttl) = lookup("ENGINEBENCH_HEALTH_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.health_cache_ttl_secs = ttl;
        }
    }

    pub fn health_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.health_cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 250,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let ok = BackendConfig::new("local", EngineKind::Ollama, "http://localhost:11434/");
        assert!(ok.validate().is_ok());
        assert_eq!(ok.endpoint(), "http://localhost:11434");

        let no_scheme = BackendConfig::new("a", EngineKind::Vllm, "localhost:8000");
        assert!(matches!(no_scheme.validate(), Err(EngineError::Config(_))));

        let empty_name = BackendConfig::new(" ", EngineKind::Tgi, "http://x");
        assert!(empty_name.validate().is_err());

        let mut zero_timeout = BackendConfig::new("t", EngineKind::Tgi, "http://x");
        zero_timeout.timeout_secs = 0;
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("vLLM".parse::<EngineKind>().unwrap(), EngineKind::Vllm);
        assert_eq!("text-generation-inference".parse::<EngineKind>().unwrap(), EngineKind::Tgi);
        assert!("triton".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_config_json_defaults() {
        let config: EngineBenchConfig = serde_json::from_str(
            r#"{"engines":[{"name":"a","kind":"tgi","base_url":"http://tgi:8080"}]}"#,
        )
        .unwrap();
        assert_eq!(config.health_cache_ttl_secs, 300);
        assert_eq!(config.engines[0].timeout_secs, 300);
        assert_eq!(config.engines[0].retry.max_attempts, 3);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineBenchConfig::default();
        config.apply_env(|key| match key {
            "VLLM_HOST" => Some("http://gpu-box:8000".to_string()),
            "ENGINEBENCH_HEALTH_TTL_SECS" => Some("30".to_string()),
            _ => None,
        });
        assert_eq!(config.engines.len(), 1);
        assert_eq!(config.engines[0].kind, EngineKind::Vllm);
        assert_eq!(config.health_cache_ttl(), Duration::from_secs(30));
    }
}
