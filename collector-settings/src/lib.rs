//! Hierarchical configuration for the collector (spec §6): pipeline
//! stage order, per-processor blocks, receiver blocks, the sink block,
//! and pool-manager defaults. Grounded on `syncserver-settings::Settings`
//! — a `config`-crate document merged with environment overrides, with
//! every duration represented as plain seconds (the teacher's own
//! `syncstorage-settings` keeps TTLs as `u32` rather than `std::time::
//! Duration` for exactly this reason: it is what the `config`/`serde`
//! boundary can deserialize without a custom visitor). The conversion
//! from these plain fields to the `Duration`-typed `*Config` structs
//! each component actually runs with happens once, at the edge, in the
//! `to_*` methods below.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use thiserror::Error;

static PREFIX: &str = "COLLECTOR";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("configuration load error: {0}")]
    Load(#[from] ConfigError),
    #[error("ash configuration error: {0}")]
    Ash(#[from] ash::ConfigError),
    #[error("pipeline configuration error: {0}")]
    Pipeline(#[from] pipeline::PipelineError),
    #[error("pool manager configuration error: {0}")]
    PoolManager(String),
}

fn secs(v: u64) -> Duration {
    Duration::from_secs(v)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolManagerSettings {
    pub global_max_connections: u32,
    pub health_check_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub enable_auto_scaling: bool,
    pub auto_scale_high_watermark: f64,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub breaker_half_open_successes: u32,
}

impl Default for PoolManagerSettings {
    fn default() -> Self {
        Self {
            global_max_connections: 500,
            health_check_interval_secs: 30,
            metrics_interval_secs: 10,
            enable_auto_scaling: false,
            auto_scale_high_watermark: 0.9,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
            breaker_half_open_successes: 1,
        }
    }
}

impl PoolManagerSettings {
    pub fn to_config(&self) -> pool_manager::ManagerConfig {
        pool_manager::ManagerConfig {
            global_max_connections: self.global_max_connections,
            health_check_interval: secs(self.health_check_interval_secs),
            metrics_interval: secs(self.metrics_interval_secs),
            enable_auto_scaling: self.enable_auto_scaling,
            breaker: pool_manager::BreakerConfig {
                failure_threshold: self.breaker_failure_threshold,
                cooldown: secs(self.breaker_cooldown_secs),
                half_open_successes: self.breaker_half_open_successes,
            },
            auto_scale_high_watermark: self.auto_scale_high_watermark,
        }
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.global_max_connections == 0 {
            return Err(SettingsError::PoolManager("global_max_connections must be positive".into()));
        }
        if self.health_check_interval_secs == 0 || self.metrics_interval_secs == 0 || self.breaker_cooldown_secs == 0 {
            return Err(SettingsError::PoolManager("pool manager intervals must be positive".into()));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(SettingsError::PoolManager("breaker_failure_threshold must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.auto_scale_high_watermark) {
            return Err(SettingsError::PoolManager("auto_scale_high_watermark must be within [0, 1]".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AshSettings {
    pub base_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub low_session_threshold: usize,
    pub high_session_threshold: usize,
    pub adjustment_interval_secs: u64,
    pub long_running_threshold_secs: u64,
    pub include_idle_sessions: bool,
    pub ring_buffer_capacity: usize,
    pub window_durations_secs: Vec<u64>,
    pub window_retention_secs: u64,
    pub window_top_n: usize,
}

impl Default for AshSettings {
    fn default() -> Self {
        Self {
            base_rate: 0.5,
            min_rate: 0.1,
            max_rate: 1.0,
            low_session_threshold: 50,
            high_session_threshold: 500,
            adjustment_interval_secs: 10,
            long_running_threshold_secs: 60,
            include_idle_sessions: false,
            ring_buffer_capacity: 4096,
            window_durations_secs: vec![60, 300, 900, 3600],
            window_retention_secs: 24 * 3600,
            window_top_n: 10,
        }
    }
}

impl AshSettings {
    pub fn to_config(&self) -> ash::AshConfig {
        ash::AshConfig {
            rate: ash::RateConfig {
                base_rate: self.base_rate,
                min_rate: self.min_rate,
                max_rate: self.max_rate,
                low_session_threshold: self.low_session_threshold,
                high_session_threshold: self.high_session_threshold,
                adjustment_interval: secs(self.adjustment_interval_secs),
            },
            long_running_threshold: secs(self.long_running_threshold_secs),
            include_idle_sessions: self.include_idle_sessions,
            ring_buffer_capacity: self.ring_buffer_capacity,
            windows: ash::WindowAggregatorConfig {
                window_durations: self.window_durations_secs.iter().map(|s| secs(*s)).collect(),
                retention: secs(self.window_retention_secs),
                top_n: self.window_top_n,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdaptiveSamplerSettings {
    pub default_sample_rate: f64,
    pub aggressive_default_sample_rate: f64,
    pub decision_cache_cap: usize,
    pub decision_cache_ttl_secs: u64,
}

impl Default for AdaptiveSamplerSettings {
    fn default() -> Self {
        Self {
            default_sample_rate: 1.0,
            aggressive_default_sample_rate: 1.0,
            decision_cache_cap: 50_000,
            decision_cache_ttl_secs: 300,
        }
    }
}

impl AdaptiveSamplerSettings {
    pub fn to_config(&self) -> pipeline::processors::adaptive_sampler::AdaptiveSamplerConfig {
        pipeline::processors::adaptive_sampler::AdaptiveSamplerConfig {
            default_sample_rate: self.default_sample_rate,
            aggressive_default_sample_rate: self.aggressive_default_sample_rate,
            decision_cache_cap: self.decision_cache_cap,
            decision_cache_ttl: secs(self.decision_cache_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    pub timeout_duration_secs: u64,
    pub half_open_successes: u32,
    pub reporting_interval_secs: u64,
    pub state_cap: usize,
    pub state_ttl_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            failure_window_secs: 60,
            timeout_duration_secs: 30,
            half_open_successes: 5,
            reporting_interval_secs: 10,
            state_cap: 10_000,
            state_ttl_secs: 3600,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> pipeline::processors::circuit_breaker::CircuitBreakerConfig {
        pipeline::processors::circuit_breaker::CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: secs(self.failure_window_secs),
            timeout_duration: secs(self.timeout_duration_secs),
            half_open_successes: self.half_open_successes,
            reporting_interval: secs(self.reporting_interval_secs),
            state_cap: self.state_cap,
            state_ttl: secs(self.state_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryCorrelatorSettings {
    pub retention_secs: u64,
    pub slow_threshold_ms: f64,
    pub moderate_threshold_ms: f64,
    pub dead_tuples_vacuum_threshold: u64,
    pub index_cap: usize,
}

impl Default for QueryCorrelatorSettings {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            slow_threshold_ms: 1000.0,
            moderate_threshold_ms: 100.0,
            dead_tuples_vacuum_threshold: 10_000,
            index_cap: 50_000,
        }
    }
}

impl QueryCorrelatorSettings {
    pub fn to_config(&self) -> pipeline::processors::query_correlator::QueryCorrelatorConfig {
        pipeline::processors::query_correlator::QueryCorrelatorConfig {
            retention: secs(self.retention_secs),
            slow_threshold_ms: self.slow_threshold_ms,
            moderate_threshold_ms: self.moderate_threshold_ms,
            dead_tuples_vacuum_threshold: self.dead_tuples_vacuum_threshold,
            index_cap: self.index_cap,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub pii_sensitivity: String,
    pub exclude_fields: Vec<String>,
    pub required_fields: Vec<String>,
    pub cardinality_limit: usize,
    pub cardinality_attribute: String,
    pub export_feedback_as_logs: bool,
    pub pii_pool_queue_cap: usize,
    /// Attribute name -> expected type (`string`/`int`/`double`), spec §4.8.
    pub field_types: std::collections::HashMap<String, String>,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        let defaults = pipeline::processors::verification::PiiConfig::default();
        Self {
            pii_sensitivity: "medium".into(),
            exclude_fields: defaults.exclude_fields.into_iter().collect(),
            required_fields: vec!["database_name".into(), "query_id".into(), "duration_ms".into()],
            cardinality_limit: 10_000,
            cardinality_attribute: "query_id".into(),
            export_feedback_as_logs: false,
            pii_pool_queue_cap: 256,
            field_types: [("database_name", "string"), ("query_id", "string"), ("duration_ms", "double")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl VerificationSettings {
    pub fn to_config(&self) -> pipeline::processors::verification::VerificationConfig {
        use pipeline::processors::verification::{ExpectedType, PiiAction, PiiConfig, QualityConfig, Sensitivity, VerificationConfig};

        let sensitivity = match self.pii_sensitivity.to_ascii_lowercase().as_str() {
            "low" => Sensitivity::Low,
            "high" => Sensitivity::High,
            _ => Sensitivity::Medium,
        };
        let field_types = self
            .field_types
            .iter()
            .filter_map(|(field, type_name)| ExpectedType::from_str(type_name).map(|t| (field.clone(), t)))
            .collect();
        VerificationConfig {
            pii: PiiConfig {
                sensitivity,
                action_by_sensitivity: [
                    (Sensitivity::Low, PiiAction::DetectOnly),
                    (Sensitivity::Medium, PiiAction::Redact),
                    (Sensitivity::High, PiiAction::Drop),
                ],
                exclude_fields: self.exclude_fields.iter().cloned().collect(),
            },
            quality: QualityConfig {
                required_fields: self.required_fields.clone(),
                cardinality_limit: self.cardinality_limit,
                cardinality_attribute: self.cardinality_attribute.clone(),
                field_types,
            },
            export_feedback_as_logs: self.export_feedback_as_logs,
            pii_pool_queue_cap: self.pii_pool_queue_cap,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanExtractorSettings {
    pub regression_ratio: f64,
    pub history_cap: usize,
    pub history_ttl_secs: u64,
}

impl Default for PlanExtractorSettings {
    fn default() -> Self {
        Self {
            regression_ratio: 1.5,
            history_cap: 50_000,
            history_ttl_secs: 24 * 3600,
        }
    }
}

impl PlanExtractorSettings {
    pub fn to_config(&self) -> pipeline::processors::plan_extractor::PlanExtractorConfig {
        pipeline::processors::plan_extractor::PlanExtractorConfig {
            regression_ratio: self.regression_ratio,
            history_cap: self.history_cap,
            history_ttl: secs(self.history_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CostControlSettings {
    pub monthly_budget_usd: f64,
    pub price_per_gb_usd: f64,
    pub aggressive_threshold_ratio: f64,
}

impl Default for CostControlSettings {
    fn default() -> Self {
        Self {
            monthly_budget_usd: 500.0,
            price_per_gb_usd: 0.05,
            aggressive_threshold_ratio: 1.0,
        }
    }
}

impl CostControlSettings {
    pub fn to_config(&self) -> pipeline::processors::cost_control::CostControlConfig {
        pipeline::processors::cost_control::CostControlConfig {
            monthly_budget_usd: self.monthly_budget_usd,
            price_per_gb_usd: self.price_per_gb_usd,
            aggressive_threshold_ratio: self.aggressive_threshold_ratio,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ErrorMonitorSettings {
    pub suppression_window_secs: u64,
    pub alert_threshold: u32,
    pub cause_cap: usize,
}

impl Default for ErrorMonitorSettings {
    fn default() -> Self {
        Self {
            suppression_window_secs: 5 * 60,
            alert_threshold: 20,
            cause_cap: 256,
        }
    }
}

impl ErrorMonitorSettings {
    pub fn to_config(&self) -> pipeline::processors::error_monitor::ErrorMonitorConfig {
        pipeline::processors::error_monitor::ErrorMonitorConfig {
            suppression_window: secs(self.suppression_window_secs),
            alert_threshold: self.alert_threshold,
            cause_cap: self.cause_cap,
        }
    }
}

/// Ordered processor names the orchestrator composes (spec §2's diagram
/// is the default order; this is here so deployments can disable a stage
/// by omitting its name rather than recompiling).
fn default_stages() -> Vec<String> {
    ["circuit_breaker", "adaptive_sampler", "plan_extractor", "query_correlator", "verification", "cost_control", "error_monitor"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub stages: Vec<String>,
    pub adaptive_sampler: AdaptiveSamplerSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub query_correlator: QueryCorrelatorSettings,
    pub verification: VerificationSettings,
    pub plan_extractor: PlanExtractorSettings,
    pub cost_control: CostControlSettings,
    pub error_monitor: ErrorMonitorSettings,
    pub feedback_channel_capacity: usize,
    pub feedback_export_as_logs: bool,
    pub shutdown_grace_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            adaptive_sampler: AdaptiveSamplerSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            query_correlator: QueryCorrelatorSettings::default(),
            verification: VerificationSettings::default(),
            plan_extractor: PlanExtractorSettings::default(),
            cost_control: CostControlSettings::default(),
            error_monitor: ErrorMonitorSettings::default(),
            feedback_channel_capacity: 1024,
            feedback_export_as_logs: false,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    /// `"noop"` or `"logging"`; a network-exporting sink is out of this
    /// crate's scope (spec Non-goals) but the field stays a string so
    /// configuration does not need to change when one is added.
    pub kind: String,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self { kind: "logging".into() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime_secs: Option<u64>,
    pub max_idle_time_secs: Option<u64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_open: 10,
            max_idle: 5,
            max_lifetime_secs: None,
            max_idle_time_secs: None,
        }
    }
}

impl PoolSettings {
    pub fn to_config(&self) -> pool_manager::PoolConfig {
        pool_manager::PoolConfig {
            max_open: self.max_open,
            max_idle: self.max_idle,
            max_lifetime: self.max_lifetime_secs.map(secs),
            max_idle_time: self.max_idle_time_secs.map(secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiverSettings {
    pub name: String,
    pub driver: String,
    pub endpoint: String,
    pub collection_interval_secs: u64,
    pub database_filter: Vec<String>,
    pub pool: PoolSettings,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            driver: "postgres".into(),
            endpoint: String::new(),
            collection_interval_secs: 10,
            database_filter: Vec::new(),
            pool: PoolSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub human_logs: bool,
    pub statsd_host: Option<String>,
    pub statsd_port: u16,
    pub pool_manager: PoolManagerSettings,
    pub ash: AshSettings,
    pub pipeline: PipelineSettings,
    pub sink: SinkSettings,
    pub receivers: Vec<ReceiverSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            human_logs: false,
            statsd_host: Some("localhost".into()),
            statsd_port: 8125,
            pool_manager: PoolManagerSettings::default(),
            ash: AshSettings::default(),
            pipeline: PipelineSettings::default(),
            sink: SinkSettings::default(),
            receivers: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads a config file if supplied, then applies environment
    /// overrides (`COLLECTOR_FOO__BAR="gorp"` → `foo.bar = "gorp"`).
    /// Environment variables are used only for secrets and endpoint
    /// overrides, never for structural behavior (spec §6).
    pub fn with_env_and_config_file(filename: Option<&str>) -> Result<Self, SettingsError> {
        let mut s = Config::default();
        if let Some(path) = filename {
            s.merge(File::with_name(path))?;
        }
        s.merge(Environment::with_prefix(PREFIX).separator("__"))?;
        Ok(s.try_into()?)
    }

    /// Runs every component's own `Validate()` (spec §6): rejects
    /// negative durations, rates outside `[0,1]`, `min_rate > max_rate`,
    /// non-positive bounded-map caps, and intervals `<= 0`.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.ash.to_config().validate()?;
        self.pool_manager.validate()?;
        self.pipeline.adaptive_sampler.to_config().validate()?;
        self.pipeline.circuit_breaker.to_config().validate()?;
        self.pipeline.query_correlator.to_config().validate()?;
        self.pipeline.verification.to_config().validate()?;
        self.pipeline.plan_extractor.to_config().validate()?;
        self.pipeline.cost_control.to_config().validate()?;
        self.pipeline.error_monitor.to_config().validate()?;
        Ok(())
    }

    pub fn banner(&self) -> String {
        format!("http://{}:{} ({} receivers, sink={})", self.host, self.port, self.receivers.len(), self.sink.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        Settings::default().validate().expect("defaults must validate");
    }

    #[test]
    fn environment_override_changes_a_nested_field() {
        std::env::set_var("COLLECTOR_POOL_MANAGER__GLOBAL_MAX_CONNECTIONS", "42");
        let settings = Settings::with_env_and_config_file(None).unwrap();
        std::env::remove_var("COLLECTOR_POOL_MANAGER__GLOBAL_MAX_CONNECTIONS");
        assert_eq!(settings.pool_manager.global_max_connections, 42);
    }

    #[test]
    fn zero_global_max_connections_fails_validation() {
        let mut settings = Settings::default();
        settings.pool_manager.global_max_connections = 0;
        assert!(settings.validate().is_err());
    }
}
