//! Core types for the dynamic-tool sandbox

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identity
// ============================================================================

/// Unique identifier for a submitted tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolId(pub Uuid);

impl ToolId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ToolId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ToolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque user identity supplied by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Tool lifecycle
// ============================================================================

/// Tool lifecycle state.
///
/// State transitions:
/// ```text
/// Submitted → Validating → {Rejected | Validated}
/// Validated → Enabled
/// Enabled → {AutoDisabled | AdminDisabled}
/// {AutoDisabled | AdminDisabled} → Validating   (re-approval, fresh validation)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Submitted,
    Validating,
    Rejected,
    Validated,
    Enabled,
    AutoDisabled,
    AdminDisabled,
}

impl ToolState {
    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        self == ToolState::Rejected
    }

    /// Check if a tool in this state may be invoked.
    pub fn is_invocable(self) -> bool {
        self == ToolState::Enabled
    }

    /// Check if a transition to `to` is valid.
    pub fn can_transition_to(self, to: ToolState) -> bool {
        match (self, to) {
            (ToolState::Submitted, ToolState::Validating) => true,
            (ToolState::Validating, ToolState::Rejected) => true,
            (ToolState::Validating, ToolState::Validated) => true,
            (ToolState::Validated, ToolState::Enabled) => true,
            (ToolState::Enabled, ToolState::AutoDisabled) => true,
            (ToolState::Enabled, ToolState::AdminDisabled) => true,
            // Re-approval always goes back through validation
            (ToolState::AutoDisabled, ToolState::Validating) => true,
            (ToolState::AdminDisabled, ToolState::Validating) => true,
            // Rejected is terminal
            (ToolState::Rejected, _) => false,
            _ => false,
        }
    }
}

/// A unit of user- or agent-submitted code, tracked through the
/// validate → compile → execute lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: ToolId,
    pub owner: UserId,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub state: ToolState,
    /// When the source last passed or failed validation.
    pub last_validated_at: Option<DateTime<Utc>>,
    /// Why the tool was disabled (auto-disable or admin override).
    pub disable_reason: Option<String>,
    /// Reason given with the most recent admin action on this tool.
    pub admin_note: Option<String>,
    /// Latest validation result for this source.
    pub last_outcome: Option<ValidationOutcome>,
}

impl Tool {
    pub fn new(owner: UserId, source: impl Into<String>) -> Self {
        Self {
            id: ToolId::new(),
            owner,
            source: source.into(),
            created_at: Utc::now(),
            state: ToolState::Submitted,
            last_validated_at: None,
            disable_reason: None,
            admin_note: None,
            last_outcome: None,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Why a piece of source failed static validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    SyntaxError,
    SourceTooLarge,
    DisallowedImport,
    DisallowedBuiltin,
    DisallowedAttribute,
    DisallowedConstruct,
    NamespaceLeak,
}

/// A specific reason a tool failed static validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// The offending construct or name, as written in the source.
    pub construct: String,
    /// 1-based source line, when known.
    pub line: Option<usize>,
    /// 1-based source column, when known.
    pub column: Option<usize>,
    pub reason: String,
}

impl Violation {
    pub fn new(
        kind: ViolationKind,
        construct: impl Into<String>,
        line: Option<usize>,
        column: Option<usize>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            construct: construct.into(),
            line,
            column,
            reason: reason.into(),
        }
    }
}

/// Result of one validation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub passed: bool,
    /// Violations ordered by source position.
    pub violations: Vec<Violation>,
    pub validated_at: DateTime<Utc>,
}

impl ValidationOutcome {
    /// Create a passing outcome.
    pub fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
            validated_at: Utc::now(),
        }
    }

    /// Create a failing outcome from a non-empty violation list.
    pub fn fail(violations: Vec<Violation>) -> Self {
        Self {
            passed: false,
            violations,
            validated_at: Utc::now(),
        }
    }
}

// ============================================================================
// Execution
// ============================================================================

/// One invocation of an enabled tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub tool_id: ToolId,
    pub caller: UserId,
    /// Structured input; size-bounded before execution.
    pub args: serde_json::Value,
    pub requested_at: DateTime<Utc>,
}

impl ExecutionRequest {
    pub fn new(tool_id: ToolId, caller: UserId, args: serde_json::Value) -> Self {
        Self {
            tool_id,
            caller,
            args,
            requested_at: Utc::now(),
        }
    }
}

/// A runtime breach of an enforced resource or capability limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxViolationKind {
    TimeoutExceeded,
    MemoryExceeded,
    CpuExceeded,
    /// A call reached the engine that the validator should have rejected.
    DisallowedRuntimeCall,
}

impl std::fmt::Display for SandboxViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxViolationKind::TimeoutExceeded => "timeout_exceeded",
            SandboxViolationKind::MemoryExceeded => "memory_exceeded",
            SandboxViolationKind::CpuExceeded => "cpu_exceeded",
            SandboxViolationKind::DisallowedRuntimeCall => "disallowed_runtime_call",
        };
        f.write_str(s)
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Violation { kind: SandboxViolationKind },
    /// Runtime fault inside the tool (bad argument, script error, cancellation).
    Error,
}

/// Resources consumed by one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Wall-clock time spent evaluating the script.
    pub elapsed_ms: u64,
    /// Engine operations performed.
    pub operations: u64,
    /// Estimated peak bytes held by script data.
    pub memory_bytes_est: u64,
    /// Fraction of the operation budget consumed (0.0 - 1.0).
    pub cpu_share: f64,
}

/// Record of a single host-bridge call made during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeCall {
    pub name: String,
    pub input: serde_json::Value,
    pub output: String,
    pub success: bool,
    pub duration_ms: u64,
}

impl BridgeCall {
    pub fn new(
        name: impl Into<String>,
        input: serde_json::Value,
        output: impl Into<String>,
        success: bool,
        duration_ms: u64,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            output: output.into(),
            success,
            duration_ms,
        }
    }
}

/// Result of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(flatten)]
    pub status: ExecutionStatus,
    /// Final script value on success.
    pub output: Option<serde_json::Value>,
    /// Error detail when status is `Error`, violation detail otherwise.
    pub error: Option<String>,
    pub usage: ResourceUsage,
    /// All host-bridge calls made during execution, in order.
    pub bridge_calls: Vec<BridgeCall>,
}

impl ExecutionResult {
    /// Create a successful result.
    pub fn success(
        output: serde_json::Value,
        usage: ResourceUsage,
        bridge_calls: Vec<BridgeCall>,
    ) -> Self {
        Self {
            status: ExecutionStatus::Success,
            output: Some(output),
            error: None,
            usage,
            bridge_calls,
        }
    }

    /// Create a result for a sandbox violation.
    pub fn violation(
        kind: SandboxViolationKind,
        detail: impl Into<String>,
        usage: ResourceUsage,
        bridge_calls: Vec<BridgeCall>,
    ) -> Self {
        Self {
            status: ExecutionStatus::Violation { kind },
            output: None,
            error: Some(detail.into()),
            usage,
            bridge_calls,
        }
    }

    /// Create a result for a runtime fault inside the tool.
    pub fn error(
        detail: impl Into<String>,
        usage: ResourceUsage,
        bridge_calls: Vec<BridgeCall>,
    ) -> Self {
        Self {
            status: ExecutionStatus::Error,
            output: None,
            error: Some(detail.into()),
            usage,
            bridge_calls,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

// ============================================================================
// Security events and risk
// ============================================================================

/// What kind of security-relevant occurrence an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    ValidationFailure,
    SandboxViolation,
    RateLimitExceeded,
    Timeout,
    ResourceExceeded,
    SuspiciousPattern,
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Append-only record of a security-relevant occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: EventId,
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub user: UserId,
    pub tool: Option<ToolId>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(
        kind: SecurityEventKind,
        severity: Severity,
        user: UserId,
        tool: Option<ToolId>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            kind,
            severity,
            user,
            tool,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

/// Per-user aggregate of recent security-event severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskScore {
    pub user: UserId,
    pub score: f64,
    /// Events inside the risk window that contribute to the score.
    pub contributing: Vec<EventId>,
    pub computed_at: DateTime<Utc>,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the sandbox's public API.
///
/// Validation violations and bridge errors are data, not errors: they are
/// carried inside [`ValidationOutcome`] and [`ExecutionResult`].
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("tool not found: {0}")]
    NotFound(ToolId),

    #[error("caller {caller} does not own tool {tool}")]
    NotOwner { tool: ToolId, caller: UserId },

    #[error("tool {tool} is disabled: {reason}")]
    ToolDisabled { tool: ToolId, reason: String },

    #[error("tool {tool} is not enabled (state: {state:?})")]
    ToolNotEnabled { tool: ToolId, state: ToolState },

    #[error("rate limit exceeded for {action}: {limit} per 24h")]
    RateLimited { action: String, limit: u32 },

    #[error("execution capacity exhausted, retry later")]
    Busy,

    #[error("arguments exceed {max} bytes")]
    ArgsTooLarge { max: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("audit store unavailable: {0}")]
    AuditUnavailable(String),

    #[error("invalid state transition: {0}")]
    StateTransition(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_state_transitions() {
        assert!(ToolState::Submitted.can_transition_to(ToolState::Validating));
        assert!(ToolState::Validating.can_transition_to(ToolState::Rejected));
        assert!(ToolState::Validating.can_transition_to(ToolState::Validated));
        assert!(ToolState::Validated.can_transition_to(ToolState::Enabled));
        assert!(ToolState::Enabled.can_transition_to(ToolState::AutoDisabled));
        assert!(ToolState::AutoDisabled.can_transition_to(ToolState::Validating));

        // Rejected is terminal
        assert!(!ToolState::Rejected.can_transition_to(ToolState::Validating));
        assert!(!ToolState::Rejected.can_transition_to(ToolState::Enabled));

        // No shortcut from Submitted straight to Enabled
        assert!(!ToolState::Submitted.can_transition_to(ToolState::Enabled));
        // Re-enabling never skips validation
        assert!(!ToolState::AutoDisabled.can_transition_to(ToolState::Enabled));
    }

    #[test]
    fn test_only_enabled_is_invocable() {
        assert!(ToolState::Enabled.is_invocable());
        assert!(!ToolState::Validated.is_invocable());
        assert!(!ToolState::AutoDisabled.is_invocable());
    }

    #[test]
    fn test_validation_outcome() {
        let pass = ValidationOutcome::pass();
        assert!(pass.passed);
        assert!(pass.violations.is_empty());

        let v = Violation::new(
            ViolationKind::DisallowedImport,
            "import",
            Some(1),
            Some(1),
            "imports are not allowed",
        );
        let fail = ValidationOutcome::fail(vec![v]);
        assert!(!fail.passed);
        assert_eq!(fail.violations[0].kind, ViolationKind::DisallowedImport);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_execution_result_constructors() {
        let ok = ExecutionResult::success(
            serde_json::json!(42),
            ResourceUsage::default(),
            vec![],
        );
        assert!(ok.is_success());
        assert!(ok.error.is_none());

        let violation = ExecutionResult::violation(
            SandboxViolationKind::TimeoutExceeded,
            "deadline breached",
            ResourceUsage::default(),
            vec![],
        );
        assert!(!violation.is_success());
        assert!(matches!(
            violation.status,
            ExecutionStatus::Violation {
                kind: SandboxViolationKind::TimeoutExceeded
            }
        ));
    }

    #[test]
    fn test_status_serialization_tags() {
        let v = ExecutionResult::violation(
            SandboxViolationKind::MemoryExceeded,
            "data too large",
            ResourceUsage::default(),
            vec![],
        );
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["status"], "violation");
        assert_eq!(json["kind"], "memory_exceeded");
    }
}
