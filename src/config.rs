//! Sandbox configuration
//!
//! One aggregate, serde-deserializable config so the host application can
//! load it from its own configuration file. Every field has a safe default.

use serde::{Deserialize, Serialize};

use crate::limits::ExecutionLimits;

/// Per-user rolling 24-hour quotas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateQuotas {
    /// Tool creations allowed per user per rolling day
    pub tool_creations_per_day: u32,
    /// Tool executions allowed per user per rolling day
    pub tool_executions_per_day: u32,
    /// Denials tolerated inside the window before one is escalated to a
    /// security event
    pub denial_tolerance: u32,
}

impl Default for RateQuotas {
    fn default() -> Self {
        Self {
            tool_creations_per_day: 5,
            tool_executions_per_day: 100,
            denial_tolerance: 3,
        }
    }
}

/// Risk-scoring and auto-disable policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPolicy {
    /// How far back events contribute to the score
    pub window_hours: i64,
    /// High/critical events inside the window that trigger auto-disable
    pub high_critical_limit: usize,
    /// Identical runtime faults from one user inside the fault window that
    /// escalate to a suspicious-pattern event
    pub repeat_fault_threshold: usize,
    /// Fault window in minutes
    pub fault_window_minutes: i64,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            window_hours: 24,
            high_critical_limit: 3,
            repeat_fault_threshold: 5,
            fault_window_minutes: 10,
        }
    }
}

/// Top-level sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Per-execution resource limits
    pub limits: ExecutionLimits,
    /// Per-user rolling quotas
    pub quotas: RateQuotas,
    /// Risk scoring and auto-disable policy
    pub risk: RiskPolicy,
    /// Executions allowed to run at once across all users
    pub max_concurrent_executions: usize,
    /// How long an invocation may wait for execution capacity before it is
    /// rejected with a backpressure signal
    pub queue_timeout_ms: u64,
    /// Largest accepted source text, in bytes
    pub max_source_bytes: usize,
    /// Largest accepted invocation arguments, serialized, in bytes
    pub max_args_bytes: usize,
    /// When true, validated tools stay at `Validated` until approved
    pub manual_review: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            limits: ExecutionLimits::default(),
            quotas: RateQuotas::default(),
            risk: RiskPolicy::default(),
            max_concurrent_executions: 8,
            queue_timeout_ms: 2_000,
            max_source_bytes: 64 * 1024,
            max_args_bytes: 64 * 1024,
            manual_review: false,
        }
    }
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set execution limits
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Builder: set quotas
    pub fn with_quotas(mut self, quotas: RateQuotas) -> Self {
        self.quotas = quotas;
        self
    }

    /// Builder: set risk policy
    pub fn with_risk(mut self, risk: RiskPolicy) -> Self {
        self.risk = risk;
        self
    }

    /// Builder: set concurrent execution cap
    pub fn with_max_concurrent_executions(mut self, max: usize) -> Self {
        self.max_concurrent_executions = max.max(1);
        self
    }

    /// Builder: set backpressure queue timeout
    pub fn with_queue_timeout_ms(mut self, ms: u64) -> Self {
        self.queue_timeout_ms = ms;
        self
    }

    /// Builder: require manual approval after validation
    pub fn with_manual_review(mut self, manual: bool) -> Self {
        self.manual_review = manual;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.quotas.tool_creations_per_day, 5);
        assert_eq!(config.quotas.tool_executions_per_day, 100);
        assert_eq!(config.max_concurrent_executions, 8);
        assert!(!config.manual_review);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: SandboxConfig = serde_json::from_str(
            r#"{ "max_concurrent_executions": 2, "quotas": { "tool_creations_per_day": 1, "tool_executions_per_day": 10, "denial_tolerance": 0 } }"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_executions, 2);
        assert_eq!(config.quotas.tool_creations_per_day, 1);
        // untouched sections keep their defaults
        assert_eq!(config.limits.timeout_ms, 5_000);
    }

    #[test]
    fn test_concurrency_floor() {
        let config = SandboxConfig::default().with_max_concurrent_executions(0);
        assert_eq!(config.max_concurrent_executions, 1);
    }
}
