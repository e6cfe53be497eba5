//! convoy.toml configuration parser.
//!
//! Holds the bounds configuration recognized by the controllers
//! (`min_capacity`, `max_capacity`, `target_value`, `min_healthy_percent`,
//! `max_surge_percent`, `cooldown_seconds`, `severity_threshold`) plus the
//! timeouts and retry knobs of each pipeline stage.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },
    #[error("invalid bounds: {0}")]
    InvalidBounds(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvoyConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    /// Registry repository images are published to.
    pub repository: String,
    /// Application port the load balancer forwards to.
    pub port: u16,
    #[serde(default = "default_cpu_units")]
    pub cpu_units: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_desired_count")]
    pub desired_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub min_healthy_percent: u32,
    pub max_surge_percent: u32,
    /// Consecutive probe successes before a starting task is healthy.
    pub healthy_threshold: u32,
    /// Consecutive probe failures before a task is unhealthy.
    pub unhealthy_threshold: u32,
    /// Unhealthy new-revision tasks tolerated before the rollout aborts.
    pub retry_budget: u32,
    pub drain_grace: String,
    pub health_timeout: String,
    pub poll_interval: String,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            min_healthy_percent: 100,
            max_surge_percent: 200,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            retry_budget: 0,
            drain_grace: "30s".to_string(),
            health_timeout: "5m".to_string(),
            poll_interval: "5s".to_string(),
        }
    }
}

/// Load-balancer probe parameters; probes are executed by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub path: String,
    pub interval: String,
    pub timeout: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            interval: "10s".to_string(),
            timeout: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Metric to track: "cpu" or "memory" (average utilization, percent).
    pub metric: String,
    pub target_value: f64,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub cooldown_seconds: u64,
    /// Fraction around 1.0 in which the error ratio causes no action.
    pub dead_band: f64,
    /// Largest change applied by a single scaling action.
    pub max_step: u32,
    /// Evaluation period of the scaling loop.
    pub interval: String,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            metric: "cpu".to_string(),
            target_value: 75.0,
            min_capacity: 1,
            max_capacity: 4,
            cooldown_seconds: 300,
            dead_band: 0.1,
            max_step: 1,
            interval: "60s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Lowest severity that blocks publication ("low" .. "critical").
    pub severity_threshold: String,
    /// CVE ids accepted regardless of severity.
    pub ignore: Vec<String>,
    pub scan_timeout: String,
    pub max_attempts: u32,
    pub base_delay: String,
    pub max_delay: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            severity_threshold: "critical".to_string(),
            ignore: Vec::new(),
            scan_timeout: "10m".to_string(),
            max_attempts: 3,
            base_delay: "2s".to_string(),
            max_delay: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_attempts: u32,
    pub base_delay: String,
    pub max_delay: String,
    pub push_timeout: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: "1s".to_string(),
            max_delay: "30s".to_string(),
            push_timeout: "2m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub build_timeout: String,
    /// Upper bound on waiting for a rollout to settle after hand-off.
    pub rollout_timeout: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            build_timeout: "20m".to_string(),
            rollout_timeout: "30m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub rules: Vec<RuleConfig>,
}

/// One reachability rule as written in the config file.
///
/// Exactly one of `cidr` or `peer_group` must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub direction: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
    pub cidr: Option<String>,
    pub peer_group: Option<String>,
}

fn default_cpu_units() -> u32 {
    256
}

fn default_memory_mb() -> u32 {
    512
}

fn default_desired_count() -> u32 {
    1
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

impl ConvoyConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ConvoyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check bounds and duration strings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scaling;
        if s.min_capacity > s.max_capacity {
            return Err(ConfigError::InvalidBounds(format!(
                "min_capacity {} exceeds max_capacity {}",
                s.min_capacity, s.max_capacity
            )));
        }
        if s.target_value <= 0.0 || !s.target_value.is_finite() {
            return Err(ConfigError::InvalidBounds(format!(
                "target_value must be positive, got {}",
                s.target_value
            )));
        }
        if !(0.0..1.0).contains(&s.dead_band) {
            return Err(ConfigError::InvalidBounds(format!(
                "dead_band must be in [0, 1), got {}",
                s.dead_band
            )));
        }

        let r = &self.rollout;
        if r.min_healthy_percent > 100 {
            return Err(ConfigError::InvalidBounds(format!(
                "min_healthy_percent {} exceeds 100",
                r.min_healthy_percent
            )));
        }
        if r.max_surge_percent < 100 {
            return Err(ConfigError::InvalidBounds(format!(
                "max_surge_percent {} is below 100",
                r.max_surge_percent
            )));
        }
        if r.healthy_threshold == 0 || r.unhealthy_threshold == 0 {
            return Err(ConfigError::InvalidBounds(
                "health thresholds must be at least 1".to_string(),
            ));
        }
        // With no surge room and no unavailability allowed, an old task can
        // never be replaced.
        for desired in [self.service.desired_count, s.min_capacity, s.max_capacity] {
            if desired == 0 {
                continue;
            }
            let min_healthy = (desired * r.min_healthy_percent).div_ceil(100);
            let max_total = desired * r.max_surge_percent / 100;
            if min_healthy >= desired && max_total <= desired {
                return Err(ConfigError::InvalidBounds(format!(
                    "rollout cannot progress at desired={desired}: \
                     min_healthy={min_healthy}, max_total={max_total}"
                )));
            }
        }

        self.rollout_timings()?;
        self.health_timings()?;
        self.scaling_interval()?;
        self.gate_retry()?;
        self.gate_scan_timeout()?;
        self.registry_retry()?;
        self.registry_push_timeout()?;
        self.pipeline_timings()?;
        Ok(())
    }

    /// `(drain_grace, health_timeout, poll_interval)`.
    pub fn rollout_timings(&self) -> Result<(Duration, Duration, Duration), ConfigError> {
        Ok((
            duration_field("rollout.drain_grace", &self.rollout.drain_grace)?,
            duration_field("rollout.health_timeout", &self.rollout.health_timeout)?,
            duration_field("rollout.poll_interval", &self.rollout.poll_interval)?,
        ))
    }

    /// `(interval, timeout)` of the load-balancer probe.
    pub fn health_timings(&self) -> Result<(Duration, Duration), ConfigError> {
        Ok((
            duration_field("health.interval", &self.health.interval)?,
            duration_field("health.timeout", &self.health.timeout)?,
        ))
    }

    pub fn scaling_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("scaling.interval", &self.scaling.interval)
    }

    pub fn gate_retry(&self) -> Result<RetryPolicy, ConfigError> {
        Ok(RetryPolicy::new(
            self.gate.max_attempts,
            duration_field("gate.base_delay", &self.gate.base_delay)?,
            duration_field("gate.max_delay", &self.gate.max_delay)?,
        ))
    }

    pub fn gate_scan_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("gate.scan_timeout", &self.gate.scan_timeout)
    }

    pub fn registry_retry(&self) -> Result<RetryPolicy, ConfigError> {
        Ok(RetryPolicy::new(
            self.registry.max_attempts,
            duration_field("registry.base_delay", &self.registry.base_delay)?,
            duration_field("registry.max_delay", &self.registry.max_delay)?,
        ))
    }

    pub fn registry_push_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("registry.push_timeout", &self.registry.push_timeout)
    }

    /// `(build_timeout, rollout_timeout)`.
    pub fn pipeline_timings(&self) -> Result<(Duration, Duration), ConfigError> {
        Ok((
            duration_field("pipeline.build_timeout", &self.pipeline.build_timeout)?,
            duration_field("pipeline.rollout_timeout", &self.pipeline.rollout_timeout)?,
        ))
    }

    /// Scaffold a minimal convoy.toml for a service.
    pub fn scaffold(service_id: &str, repository: &str, port: u16) -> Self {
        ConvoyConfig {
            service: ServiceConfig {
                id: service_id.to_string(),
                repository: repository.to_string(),
                port,
                cpu_units: default_cpu_units(),
                memory_mb: default_memory_mb(),
                desired_count: 2,
            },
            rollout: RolloutConfig::default(),
            health: HealthConfig::default(),
            scaling: ScalingConfig::default(),
            gate: GateConfig::default(),
            registry: RegistryConfig::default(),
            pipeline: PipelineConfig::default(),
            security: SecurityConfig {
                rules: vec![RuleConfig {
                    direction: "ingress".to_string(),
                    protocol: default_protocol(),
                    from_port: port,
                    to_port: port,
                    cidr: None,
                    peer_group: Some("load-balancer".to_string()),
                }],
            },
        }
    }
}
