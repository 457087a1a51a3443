//! Tool Sandbox - a capability sandbox for user- and agent-submitted tool
//! scripts
//!
//! Source code submitted at runtime (by an end user, or by an AI agent on a
//! user's behalf) is taken through a multi-stage pipeline before anything
//! runs:
//!
//! 1. **Static validation** - the source is scanned and parsed, and any
//!    disallowed construct, name, or call is rejected with a precise
//!    violation before any execution is attempted.
//! 2. **Capability compilation** - execution engines are built from a raw
//!    namespace containing only whitelisted value/collection primitives and
//!    the fixed host-bridge function set; nothing in the host environment
//!    is reachable unless listed.
//! 3. **Resource-bounded execution** - each invocation runs on a bounded
//!    worker pool under a wall-clock deadline, an operation budget, and
//!    data-size ceilings, with external cancellation.
//!
//! Around the pipeline sit per-user rolling rate limits, an append-only
//! security audit trail that fails operations closed when unavailable, and
//! a risk engine that auto-disables the tools of users who accumulate
//! high-severity events.
//!
//! ## Example
//!
//! ```ignore
//! use tool_sandbox::{SandboxConfig, ToolSandbox, UserId};
//!
//! let sandbox = ToolSandbox::new(SandboxConfig::default());
//!
//! let submission = sandbox.submit_tool(
//!     UserId::from("alice"),
//!     r#"
//!         let records = fetch_records(args.owner);
//!         if records.ok { records.value.len() } else { 0 }
//!     "#,
//! )?;
//! assert!(submission.outcome.passed);
//!
//! let result = sandbox
//!     .invoke_tool(
//!         submission.tool_id,
//!         UserId::from("alice"),
//!         serde_json::json!({ "owner": "alice" }),
//!     )
//!     .await?;
//! assert!(result.is_success());
//! ```

pub mod audit;
pub mod bridge;
pub mod compiler;
pub mod config;
pub mod executor;
pub mod limits;
pub mod rate_limit;
pub mod service;
pub mod types;
pub mod validator;

// Re-export the public surface
pub use audit::{AuditError, AuditLog, AuditSink, EventFilter, InMemoryAuditStore, RiskEngine};
pub use bridge::{BridgeError, BridgeStore, HostBridge, InMemoryStore, Record, BRIDGE_FUNCTIONS};
pub use compiler::CapabilityCompiler;
pub use config::{RateQuotas, RiskPolicy, SandboxConfig};
pub use executor::{ExecutionOutput, ToolExecutor};
pub use limits::{
    ExecutionLimits, DEFAULT_CPU_SHARE_PERCENT, DEFAULT_MEMORY_LIMIT_BYTES, DEFAULT_TIMEOUT_MS,
};
pub use rate_limit::{ActionKind, RateLimitDenial, RateLimiter};
pub use service::{Submission, ToolSandbox};
pub use types::{
    BridgeCall, EventId, ExecutionRequest, ExecutionResult, ExecutionStatus, ResourceUsage,
    RiskScore, SandboxError, SandboxViolationKind, SecurityEvent, SecurityEventKind, Severity,
    Tool, ToolId, ToolState, UserId, ValidationOutcome, Violation, ViolationKind,
};
pub use validator::{StaticValidator, ValidationPolicy};
