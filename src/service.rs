//! Sandbox service - the external interface of the subsystem
//!
//! `ToolSandbox` wires the pipeline together: submission runs rate check →
//! static validation → capability compile check and stores the tool;
//! invocation runs state and ownership checks → rate check → bounded
//! execution, then feeds every security observation into the audit engine.
//! An unavailable audit store fails the triggering operation closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{
    AuditError, AuditLog, AuditSink, AutoDisable, EventFilter, FaultTracker, InMemoryAuditStore,
};
use crate::bridge::{BridgeStore, HostBridge, InMemoryStore, BRIDGE_FUNCTIONS};
use crate::compiler::CapabilityCompiler;
use crate::config::SandboxConfig;
use crate::executor::ToolExecutor;
use crate::rate_limit::{ActionKind, RateLimitDenial, RateLimiter};
use crate::types::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, RiskScore, SandboxError,
    SandboxViolationKind, SecurityEvent, SecurityEventKind, Severity, Tool, ToolId, ToolState,
    UserId, ValidationOutcome,
};
use crate::validator::{StaticValidator, ValidationPolicy};

/// Result of submitting source: the stored tool id and its validation
/// outcome. The tool is enabled only when the outcome passed (and manual
/// review is off).
#[derive(Debug, Clone)]
pub struct Submission {
    pub tool_id: ToolId,
    pub outcome: ValidationOutcome,
}

/// The dynamic-tool sandbox.
pub struct ToolSandbox {
    config: SandboxConfig,
    validator: StaticValidator,
    compiler: CapabilityCompiler,
    executor: ToolExecutor,
    tools: RwLock<HashMap<ToolId, Tool>>,
    rate: Mutex<RateLimiter>,
    audit: AuditLog,
    faults: FaultTracker,
}

impl ToolSandbox {
    /// Sandbox backed by in-memory stores. The host swaps in its own with
    /// [`with_stores`](Self::with_stores).
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_stores(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryAuditStore::new()),
        )
    }

    /// Sandbox backed by host-provided bridge and audit stores.
    pub fn with_stores(
        config: SandboxConfig,
        bridge_store: Arc<dyn BridgeStore>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Self {
        let bridge = HostBridge::new(bridge_store);
        let validator = StaticValidator::new(
            ValidationPolicy::new(config.max_source_bytes, config.limits.max_expr_depth)
                .with_bridge_functions(BRIDGE_FUNCTIONS.iter().copied()),
        );
        let executor = ToolExecutor::new(&config, bridge);
        let rate = Mutex::new(RateLimiter::new(config.quotas.clone()));
        let audit = AuditLog::new(audit_sink, config.risk.clone());
        let faults = FaultTracker::new(&config.risk);

        Self {
            config,
            validator,
            compiler: CapabilityCompiler::new(),
            executor,
            tools: RwLock::new(HashMap::new()),
            rate,
            audit,
            faults,
        }
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Submit source as a new tool for `owner`.
    ///
    /// The tool is stored whatever the outcome; rejected tools stay
    /// queryable (and terminal) so the submitter can inspect the
    /// violations.
    pub fn submit_tool(
        &self,
        owner: UserId,
        source: impl Into<String>,
    ) -> Result<Submission, SandboxError> {
        self.check_rate(&owner, ActionKind::ToolCreate)?;

        let mut tool = Tool::new(owner.clone(), source);
        self.transition(&mut tool, ToolState::Validating)?;

        let (mut outcome, _ast) = self.validator.validate(&tool.source);
        if outcome.passed {
            // a construct that validated but cannot bind in the capability
            // namespace is a validation failure too
            if let Err(violation) = self
                .compiler
                .compile_check(&tool.source, &self.config.limits)
            {
                outcome = ValidationOutcome::fail(vec![violation]);
            }
        }

        tool.last_validated_at = Some(Utc::now());
        if outcome.passed {
            self.transition(&mut tool, ToolState::Validated)?;
            if !self.config.manual_review {
                self.transition(&mut tool, ToolState::Enabled)?;
            }
            info!(tool = %tool.id, owner = %owner, "tool validated");
        } else {
            self.transition(&mut tool, ToolState::Rejected)?;
            self.record_validation_failure(&owner, tool.id, &outcome)?;
        }
        tool.last_outcome = Some(outcome.clone());

        let tool_id = tool.id;
        self.tools_mut()?.insert(tool_id, tool);
        Ok(Submission { tool_id, outcome })
    }

    /// Enable a validated tool held for manual review.
    pub fn approve_tool(&self, tool_id: ToolId) -> Result<(), SandboxError> {
        let mut tools = self.tools_mut()?;
        let tool = tools.get_mut(&tool_id).ok_or(SandboxError::NotFound(tool_id))?;
        if !tool.state.can_transition_to(ToolState::Enabled) {
            return Err(SandboxError::state_transition(format!(
                "tool {tool_id} cannot be enabled from {:?}",
                tool.state
            )));
        }
        tool.state = ToolState::Enabled;
        Ok(())
    }

    /// Delete a tool. Owner-only.
    pub fn delete_tool(&self, tool_id: ToolId, caller: &UserId) -> Result<(), SandboxError> {
        let mut tools = self.tools_mut()?;
        let tool = tools.get(&tool_id).ok_or(SandboxError::NotFound(tool_id))?;
        if &tool.owner != caller {
            return Err(SandboxError::NotOwner {
                tool: tool_id,
                caller: caller.clone(),
            });
        }
        tools.remove(&tool_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------

    /// Invoke an enabled tool.
    pub async fn invoke_tool(
        &self,
        tool_id: ToolId,
        caller: UserId,
        args: serde_json::Value,
    ) -> Result<ExecutionResult, SandboxError> {
        self.invoke_with_cancellation(tool_id, caller, args, CancellationToken::new())
            .await
    }

    /// Invoke an enabled tool with an externally cancellable handle.
    pub async fn invoke_with_cancellation(
        &self,
        tool_id: ToolId,
        caller: UserId,
        args: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let (source, outcome_passed) = {
            let tools = self.tools_read()?;
            let tool = tools.get(&tool_id).ok_or(SandboxError::NotFound(tool_id))?;
            if tool.owner != caller {
                return Err(SandboxError::NotOwner {
                    tool: tool_id,
                    caller,
                });
            }
            match tool.state {
                ToolState::Enabled => {}
                ToolState::AutoDisabled | ToolState::AdminDisabled => {
                    return Err(SandboxError::ToolDisabled {
                        tool: tool_id,
                        reason: tool
                            .disable_reason
                            .clone()
                            .unwrap_or_else(|| "disabled".to_string()),
                    });
                }
                state => {
                    return Err(SandboxError::ToolNotEnabled {
                        tool: tool_id,
                        state,
                    });
                }
            }
            (
                tool.source.clone(),
                tool.last_outcome.as_ref().map_or(false, |o| o.passed),
            )
        };

        // an enabled tool always carries a passing outcome; refuse to run
        // anything whose record says otherwise
        if !outcome_passed {
            return Err(SandboxError::state_transition(format!(
                "tool {tool_id} is enabled without a passing validation outcome"
            )));
        }

        self.check_rate(&caller, ActionKind::ToolInvoke)?;

        let request = ExecutionRequest::new(tool_id, caller.clone(), args);
        let output = self.executor.execute(source, request, cancel).await?;

        for requested in &output.breaches {
            self.record_event(SecurityEvent::new(
                SecurityEventKind::SuspiciousPattern,
                Severity::Critical,
                caller.clone(),
                Some(tool_id),
                format!("bridge call attempted access to data of '{requested}'"),
            ))?;
        }

        if let ExecutionStatus::Violation { kind } = &output.result.status {
            let event_kind = match kind {
                SandboxViolationKind::TimeoutExceeded => SecurityEventKind::Timeout,
                SandboxViolationKind::MemoryExceeded | SandboxViolationKind::CpuExceeded => {
                    SecurityEventKind::ResourceExceeded
                }
                SandboxViolationKind::DisallowedRuntimeCall => {
                    SecurityEventKind::SandboxViolation
                }
            };
            let detail = output
                .result
                .error
                .clone()
                .unwrap_or_else(|| kind.to_string());
            self.record_event(SecurityEvent::new(
                event_kind,
                Severity::High,
                caller.clone(),
                Some(tool_id),
                detail,
            ))?;
        }

        if let Some(signature) = &output.fault_signature {
            if self.faults.note(&caller, signature) {
                self.record_event(SecurityEvent::new(
                    SecurityEventKind::SuspiciousPattern,
                    Severity::Medium,
                    caller.clone(),
                    Some(tool_id),
                    format!("repeated runtime fault: {signature}"),
                ))?;
            }
        }

        Ok(output.result)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Security events matching the filter.
    pub fn events(&self, filter: &EventFilter) -> Result<Vec<SecurityEvent>, SandboxError> {
        self.audit
            .query(filter)
            .map_err(|e| SandboxError::AuditUnavailable(e.to_string()))
    }

    /// Current risk score for a user.
    pub fn risk_score(&self, user: &UserId) -> RiskScore {
        self.audit.risk_score(user)
    }

    /// Snapshot of a tool.
    pub fn tool(&self, tool_id: ToolId) -> Option<Tool> {
        self.tools.read().ok()?.get(&tool_id).cloned()
    }

    // ------------------------------------------------------------------
    // Admin overrides
    // ------------------------------------------------------------------

    /// Disable a specific tool. The reason is mandatory and persisted.
    pub fn admin_disable(&self, tool_id: ToolId, reason: &str) -> Result<(), SandboxError> {
        if reason.trim().is_empty() {
            return Err(SandboxError::InvalidArgument(
                "a disable reason is required".to_string(),
            ));
        }
        let mut tools = self.tools_mut()?;
        let tool = tools.get_mut(&tool_id).ok_or(SandboxError::NotFound(tool_id))?;
        if !tool.state.can_transition_to(ToolState::AdminDisabled) {
            return Err(SandboxError::state_transition(format!(
                "tool {tool_id} cannot be disabled from {:?}",
                tool.state
            )));
        }
        tool.state = ToolState::AdminDisabled;
        tool.disable_reason = Some(reason.to_string());
        tool.admin_note = Some(reason.to_string());
        warn!(tool = %tool_id, reason, "tool disabled by admin");
        Ok(())
    }

    /// Re-enable a disabled tool. The reason is mandatory, and the source
    /// goes through a fresh validation pass first.
    pub fn admin_enable(&self, tool_id: ToolId, reason: &str) -> Result<(), SandboxError> {
        if reason.trim().is_empty() {
            return Err(SandboxError::InvalidArgument(
                "an enable reason is required".to_string(),
            ));
        }
        let mut tools = self.tools_mut()?;
        let tool = tools.get_mut(&tool_id).ok_or(SandboxError::NotFound(tool_id))?;
        if !tool.state.can_transition_to(ToolState::Validating) {
            return Err(SandboxError::state_transition(format!(
                "tool {tool_id} cannot be re-validated from {:?}",
                tool.state
            )));
        }
        tool.state = ToolState::Validating;

        let (outcome, _ast) = self.validator.validate(&tool.source);
        tool.last_validated_at = Some(Utc::now());
        if outcome.passed {
            tool.state = ToolState::Enabled;
            tool.disable_reason = None;
        } else {
            tool.state = ToolState::Rejected;
        }
        let passed = outcome.passed;
        tool.last_outcome = Some(outcome);
        tool.admin_note = Some(reason.to_string());
        info!(tool = %tool_id, reason, passed, "admin re-enable validated");

        if passed {
            Ok(())
        } else {
            Err(SandboxError::state_transition(format!(
                "tool {tool_id} failed re-validation and is now rejected"
            )))
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn tools_read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<ToolId, Tool>>, SandboxError> {
        self.tools
            .read()
            .map_err(|_| SandboxError::internal("tool registry lock poisoned"))
    }

    fn tools_mut(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<ToolId, Tool>>, SandboxError> {
        self.tools
            .write()
            .map_err(|_| SandboxError::internal("tool registry lock poisoned"))
    }

    fn transition(&self, tool: &mut Tool, to: ToolState) -> Result<(), SandboxError> {
        if !tool.state.can_transition_to(to) {
            return Err(SandboxError::state_transition(format!(
                "tool {} cannot move {:?} -> {to:?}",
                tool.id, tool.state
            )));
        }
        tool.state = to;
        Ok(())
    }

    fn check_rate(&self, user: &UserId, action: ActionKind) -> Result<(), SandboxError> {
        let denial: RateLimitDenial = {
            let mut rate = self
                .rate
                .lock()
                .map_err(|_| SandboxError::internal("rate limiter lock poisoned"))?;
            match rate.check_and_record(user, action) {
                Ok(()) => return Ok(()),
                Err(denial) => denial,
            }
        };

        if denial.escalate {
            self.record_event(SecurityEvent::new(
                SecurityEventKind::RateLimitExceeded,
                Severity::Medium,
                user.clone(),
                None,
                format!(
                    "repeated {} denials beyond tolerance (limit {} per 24h)",
                    denial.action.as_str(),
                    denial.limit
                ),
            ))?;
        }
        Err(SandboxError::RateLimited {
            action: denial.action.as_str().to_string(),
            limit: denial.limit,
        })
    }

    fn record_validation_failure(
        &self,
        owner: &UserId,
        tool_id: ToolId,
        outcome: &ValidationOutcome,
    ) -> Result<(), SandboxError> {
        let summary = outcome
            .violations
            .first()
            .map(|v| format!("{:?}: {}", v.kind, v.reason))
            .unwrap_or_else(|| "validation failed".to_string());
        self.record_event(SecurityEvent::new(
            SecurityEventKind::ValidationFailure,
            Severity::Low,
            owner.clone(),
            Some(tool_id),
            summary.clone(),
        ))?;

        // the same rejection over and over is a probe, not a typo
        if self.faults.note(owner, &format!("validation:{summary}")) {
            self.record_event(SecurityEvent::new(
                SecurityEventKind::SuspiciousPattern,
                Severity::Medium,
                owner.clone(),
                Some(tool_id),
                format!("repeated validation failure: {summary}"),
            ))?;
        }
        Ok(())
    }

    /// Append an event, failing closed on an unavailable store, and apply
    /// any auto-disable decision it triggers.
    fn record_event(&self, event: SecurityEvent) -> Result<(), SandboxError> {
        match self.audit.record(event) {
            Ok(Some(disable)) => self.apply_auto_disable(disable),
            Ok(None) => Ok(()),
            Err(AuditError(msg)) => Err(SandboxError::AuditUnavailable(msg)),
        }
    }

    fn apply_auto_disable(&self, disable: AutoDisable) -> Result<(), SandboxError> {
        let ids: Vec<String> = disable.contributing.iter().map(|id| id.to_string()).collect();
        let reason = format!("risk threshold crossed; triggering events: {}", ids.join(", "));
        let mut tools = self.tools_mut()?;
        for tool in tools.values_mut() {
            if tool.owner == disable.user && tool.state == ToolState::Enabled {
                tool.state = ToolState::AutoDisabled;
                tool.disable_reason = Some(reason.clone());
                warn!(tool = %tool.id, user = %disable.user, "tool auto-disabled");
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
