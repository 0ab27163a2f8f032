//! Configuration structures.
//!
//! Configuration is loaded from JSON config files; every field has a default
//! so partial files are accepted.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::Error;

/// Global core configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
pub struct Config {
    /// Event bus and history configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Request/response layer configuration.
    #[serde(default)]
    pub request: RequestConfig,

    /// Module registry and budgeting configuration.
    #[serde(default)]
    pub modules: ModulesConfig,

    /// Self-optimization loop configuration.
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON document and validate it.
    pub fn from_json_str(raw: &str) -> super::Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> super::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// JSON schema of the config file, for tooling.
    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(Config);
        serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> super::Result<()> {
        if self.bus.history_capacity == 0 {
            return Err(Error::validation("bus.history_capacity must be positive"));
        }
        if self.request.default_timeout_ms == 0 {
            return Err(Error::validation(
                "request.default_timeout_ms must be positive",
            ));
        }
        if self.request.default_timeout_ms > self.request.max_timeout_ms {
            return Err(Error::validation(format!(
                "request.default_timeout_ms ({}) exceeds request.max_timeout_ms ({})",
                self.request.default_timeout_ms, self.request.max_timeout_ms
            )));
        }
        if self.modules.budget_mb == 0 {
            return Err(Error::validation("modules.budget_mb must be positive"));
        }
        crate::validation::validate_unit_interval(
            self.modules.alignment_threshold,
            "modules.alignment_threshold",
        )?;
        crate::validation::validate_unit_interval(
            self.optimizer.memory_pressure_threshold,
            "optimizer.memory_pressure_threshold",
        )?;
        if self.optimizer.footprint_ratio_threshold <= 0.0 {
            return Err(Error::validation(
                "optimizer.footprint_ratio_threshold must be positive",
            ));
        }
        if self.optimizer.period.is_zero() {
            return Err(Error::validation("optimizer.period must be positive"));
        }
        if self.optimizer.event_window.is_zero() {
            return Err(Error::validation("optimizer.event_window must be positive"));
        }
        if self.optimizer.event_window > self.bus.volume_retention {
            return Err(Error::validation(
                "optimizer.event_window cannot exceed bus.volume_retention",
            ));
        }
        Ok(())
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BusConfig {
    /// Akashic Record capacity (oldest entries evicted beyond this).
    pub history_capacity: usize,

    /// Type root segments that the publish throttle never rejects. The
    /// core's own roots are always exempt in addition to these.
    pub throttle_exempt_roots: Vec<String>,

    /// How long publish timestamps are kept for event-volume sampling.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub volume_retention: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            throttle_exempt_roots: crate::events::CORE_ROOTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            volume_retention: Duration::from_secs(60),
        }
    }
}

/// Request/response configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RequestConfig {
    /// Timeout applied when the caller passes 0.
    pub default_timeout_ms: u64,

    /// Upper bound for caller-requested timeouts.
    pub max_timeout_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            max_timeout_ms: 30_000,
        }
    }
}

/// Order in which active modules are deactivated to free budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionOrder {
    /// Lowest Telos alignment first, then lowest integrity.
    #[default]
    LowestAlignment,
    /// Lowest integrity score first, then lowest alignment.
    LowestIntegrity,
    /// Largest resource footprint first.
    LargestFootprint,
}

/// Module registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ModulesConfig {
    /// Process-wide budget for the summed footprint of active modules.
    pub budget_mb: u64,

    /// Modules scoring below this against the Telos are deactivated.
    pub alignment_threshold: f64,

    /// Re-initialization attempts allowed after a failure.
    pub max_retries: u32,

    /// Eviction order used when the budget is exceeded.
    pub eviction_order: EvictionOrder,

    /// Modules deactivated per low-memory signal.
    pub low_memory_shed_count: usize,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            budget_mb: 1024,
            alignment_threshold: 0.3,
            max_retries: 3,
            eviction_order: EvictionOrder::LowestAlignment,
            low_memory_shed_count: 1,
        }
    }
}

/// Self-optimization configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Tick period of the control loop.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub period: Duration,

    /// Memory-pressure ratio above which history is cleared.
    pub memory_pressure_threshold: f64,

    /// Publishes per `event_window` above which the bus is congested.
    pub event_volume_threshold: usize,

    /// Sliding window for event volume.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub event_window: Duration,

    /// Active footprint / budget ratio above which modules are rebalanced.
    pub footprint_ratio_threshold: f64,

    /// Rate applied by the default congestion policy.
    pub throttle_events_per_second: u32,

    /// How long the throttle stays engaged.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub throttle_cooldown: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(30),
            memory_pressure_threshold: 0.85,
            event_volume_threshold: 500,
            event_window: Duration::from_secs(10),
            footprint_ratio_threshold: 0.9,
            throttle_events_per_second: 50,
            throttle_cooldown: Duration::from_secs(30),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bus.history_capacity, 1000);
        assert_eq!(config.modules.eviction_order, EvictionOrder::LowestAlignment);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json_str(
            r#"{"modules": {"budget_mb": 500}, "optimizer": {"period": "5s"}}"#,
        )
        .unwrap();
        assert_eq!(config.modules.budget_mb, 500);
        assert_eq!(config.modules.max_retries, 3);
        assert_eq!(config.optimizer.period, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = Config::from_json_str(r#"{"bus": {"history_capacity": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("history_capacity"));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let err =
            Config::from_json_str(r#"{"modules": {"alignment_threshold": 1.5}}"#).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_default_timeout_above_max_rejected() {
        let err = Config::from_json_str(
            r#"{"request": {"default_timeout_ms": 40000, "max_timeout_ms": 30000}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_timeout_ms"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"modules": {{"eviction_order": "largest_footprint"}}}}"#).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.modules.eviction_order, EvictionOrder::LargestFootprint);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Config::from_file("/nonexistent/telos.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_json_schema_lists_sections() {
        let schema = Config::json_schema();
        let props = &schema["properties"];
        assert!(props.get("bus").is_some());
        assert!(props.get("optimizer").is_some());
    }
}
