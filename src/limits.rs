//! Execution limits for resource-bounded script execution

use serde::{Deserialize, Serialize};

/// Default wall-clock timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
/// Default memory ceiling in bytes (50 MiB).
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 50 * 1024 * 1024;
/// Default CPU share as a percentage of one core.
pub const DEFAULT_CPU_SHARE_PERCENT: u8 = 25;
/// Assumed engine throughput on a fully-loaded core, in operations per second.
/// The CPU ceiling is realized as an operation budget derived from this.
pub const DEFAULT_OPS_PER_SECOND: u64 = 20_000_000;
/// Default function call-stack depth.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 32;
/// Default expression nesting depth.
pub const DEFAULT_MAX_EXPR_DEPTH: usize = 64;

/// Limits enforced on every sandboxed execution.
///
/// The wall-clock timeout is enforced through the engine's progress hook,
/// the memory ceiling through data-size limits derived from it, and the CPU
/// ceiling through an operation budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Wall-clock timeout in milliseconds
    pub timeout_ms: u64,
    /// Memory ceiling in bytes for script-held data
    pub memory_limit_bytes: usize,
    /// CPU ceiling as a percentage of one core (1-100)
    pub cpu_share_percent: u8,
    /// Assumed full-core engine throughput, operations per second
    pub ops_per_second: u64,
    /// Maximum function call-stack depth
    pub max_call_depth: usize,
    /// Maximum expression nesting depth
    pub max_expr_depth: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            cpu_share_percent: DEFAULT_CPU_SHARE_PERCENT,
            ops_per_second: DEFAULT_OPS_PER_SECOND,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_expr_depth: DEFAULT_MAX_EXPR_DEPTH,
        }
    }
}

impl ExecutionLimits {
    /// Create new limits with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Tight limits for untrusted first-run tools
    pub fn strict() -> Self {
        Self {
            timeout_ms: 1_000,
            memory_limit_bytes: 8 * 1024 * 1024,
            cpu_share_percent: 10,
            ..Default::default()
        }
    }

    /// Relaxed limits for long-running, reviewed tools
    pub fn relaxed() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_limit_bytes: 128 * 1024 * 1024,
            cpu_share_percent: 50,
            ..Default::default()
        }
    }

    /// Builder: set wall-clock timeout
    pub fn with_timeout_ms(mut self, timeout: u64) -> Self {
        self.timeout_ms = timeout;
        self
    }

    /// Builder: set memory ceiling
    pub fn with_memory_limit_bytes(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Builder: set CPU share percentage (clamped to 1-100)
    pub fn with_cpu_share_percent(mut self, percent: u8) -> Self {
        self.cpu_share_percent = percent.clamp(1, 100);
        self
    }

    /// Builder: set assumed full-core throughput
    pub fn with_ops_per_second(mut self, ops: u64) -> Self {
        self.ops_per_second = ops;
        self
    }

    /// Builder: set call-stack depth
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Operation budget realizing the CPU ceiling over the timeout window.
    ///
    /// Breaching it terminates the execution with a `cpu_exceeded` violation.
    pub fn max_operations(&self) -> u64 {
        let per_ms = self.ops_per_second / 1_000;
        let budget = per_ms
            .saturating_mul(self.timeout_ms)
            .saturating_mul(u64::from(self.cpu_share_percent))
            / 100;
        // zero would disable the budget entirely
        budget.max(1_000)
    }

    /// Maximum string size, derived from the memory ceiling.
    pub fn max_string_size(&self) -> usize {
        self.memory_limit_bytes / 4
    }

    /// Maximum array length, derived from the memory ceiling.
    pub fn max_array_size(&self) -> usize {
        self.memory_limit_bytes / 64
    }

    /// Maximum map entry count, derived from the memory ceiling.
    pub fn max_map_size(&self) -> usize {
        self.memory_limit_bytes / 64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.timeout_ms, 5_000);
        assert_eq!(limits.memory_limit_bytes, 50 * 1024 * 1024);
        assert_eq!(limits.cpu_share_percent, 25);
    }

    #[test]
    fn test_strict_limits() {
        let limits = ExecutionLimits::strict();
        assert_eq!(limits.timeout_ms, 1_000);
        assert_eq!(limits.cpu_share_percent, 10);
    }

    #[test]
    fn test_relaxed_limits() {
        let limits = ExecutionLimits::relaxed();
        assert_eq!(limits.timeout_ms, 30_000);
        assert_eq!(limits.memory_limit_bytes, 128 * 1024 * 1024);
    }

    #[test]
    fn test_builder_pattern() {
        let limits = ExecutionLimits::default()
            .with_timeout_ms(2_000)
            .with_memory_limit_bytes(16 * 1024 * 1024)
            .with_cpu_share_percent(50);

        assert_eq!(limits.timeout_ms, 2_000);
        assert_eq!(limits.memory_limit_bytes, 16 * 1024 * 1024);
        assert_eq!(limits.cpu_share_percent, 50);
    }

    #[test]
    fn test_cpu_share_clamped() {
        let limits = ExecutionLimits::default().with_cpu_share_percent(0);
        assert_eq!(limits.cpu_share_percent, 1);
    }

    #[test]
    fn test_operation_budget_scales_with_share() {
        let quarter = ExecutionLimits::default().with_cpu_share_percent(25);
        let half = ExecutionLimits::default().with_cpu_share_percent(50);
        assert_eq!(quarter.max_operations() * 2, half.max_operations());
    }

    #[test]
    fn test_data_sizes_derive_from_memory_limit() {
        let limits = ExecutionLimits::default().with_memory_limit_bytes(1024);
        assert_eq!(limits.max_string_size(), 256);
        assert_eq!(limits.max_array_size(), 16);
    }
}
