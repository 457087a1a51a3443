//! Resource-bounded execution of validated tools
//!
//! Each execution gets its own capability engine on the blocking pool, a
//! wall-clock deadline and external cancellation enforced through the
//! engine's progress hook, and an operation budget and data-size limits
//! enforced by the engine itself. Exceeding any limit terminates that
//! execution only; concurrent executions share no mutable state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rhai::{Dynamic, EvalAltResult, Scope};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::{ExecutionProbe, HostBridge};
use crate::compiler::CapabilityCompiler;
use crate::config::SandboxConfig;
use crate::limits::ExecutionLimits;
use crate::types::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, ResourceUsage, SandboxError,
    SandboxViolationKind,
};

/// Wall-clock allowance for an execution to wind down after its deadline.
const GRACE_PERIOD_MS: u64 = 500;
/// The progress hook re-checks deadline/cancellation every 1024 operations.
const PROGRESS_CHECK_MASK: u64 = 0x3FF;

/// What one execution produced, plus the security-relevant observations the
/// caller feeds into the audit engine.
#[derive(Debug)]
pub struct ExecutionOutput {
    pub result: ExecutionResult,
    /// Owner ids of attempted cross-user bridge accesses.
    pub breaches: Vec<String>,
    /// Dedup key for a runtime fault, for repeat-fault detection.
    pub fault_signature: Option<String>,
}

/// Runs compiled tools under enforced resource limits with bounded
/// concurrency.
pub struct ToolExecutor {
    limits: ExecutionLimits,
    queue_timeout: Duration,
    max_args_bytes: usize,
    permits: Arc<Semaphore>,
    bridge: HostBridge,
}

impl ToolExecutor {
    pub fn new(config: &SandboxConfig, bridge: HostBridge) -> Self {
        Self {
            limits: config.limits.clone(),
            queue_timeout: Duration::from_millis(config.queue_timeout_ms),
            max_args_bytes: config.max_args_bytes,
            permits: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
            bridge,
        }
    }

    /// Execute tool source for one request.
    ///
    /// `cancel` lets the host abort the execution externally (e.g. when the
    /// caller disconnects); the engine notices within the progress-hook
    /// check interval and winds down inside the grace period.
    pub async fn execute(
        &self,
        source: String,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput, SandboxError> {
        let args_len = serde_json::to_vec(&request.args)
            .map_err(|e| SandboxError::internal(format!("unserializable arguments: {e}")))?
            .len();
        if args_len > self.max_args_bytes {
            return Err(SandboxError::ArgsTooLarge {
                max: self.max_args_bytes,
            });
        }

        // Backpressure: wait a bounded time for capacity, then reject.
        let permit = match tokio::time::timeout(
            self.queue_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Err(_) => return Err(SandboxError::Busy),
            Ok(Err(_)) => return Err(SandboxError::internal("executor semaphore closed")),
            Ok(Ok(permit)) => permit,
        };

        let queued_ms = (Utc::now() - request.requested_at).num_milliseconds();
        debug!(tool = %request.tool_id, caller = %request.caller, queued_ms, "execution admitted");

        let probe = ExecutionProbe::new(request.caller);
        let args = request.args;
        let limits = self.limits.clone();
        let bridge = self.bridge.clone();
        let task_probe = probe.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let result = run_script(&source, &limits, &bridge, &task_probe, args, &task_cancel);
            drop(permit);
            result
        });

        // The progress hook guarantees termination; the outer timeout is the
        // bounded grace period on top of it.
        let wind_down = Duration::from_millis(self.limits.timeout_ms + 2 * GRACE_PERIOD_MS);
        let result = match tokio::time::timeout(wind_down, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "execution task failed");
                return Err(SandboxError::internal(format!(
                    "execution task failed: {join_err}"
                )));
            }
            Err(_) => {
                warn!("execution did not wind down within the grace period");
                ExecutionResult::violation(
                    SandboxViolationKind::TimeoutExceeded,
                    format!(
                        "execution exceeded the {}ms timeout and its grace period",
                        self.limits.timeout_ms
                    ),
                    ResourceUsage::default(),
                    probe.calls(),
                )
            }
        };

        let fault_signature = match &result.status {
            ExecutionStatus::Error => result
                .error
                .as_deref()
                .filter(|msg| !msg.starts_with("execution cancelled"))
                .map(fault_signature),
            _ => None,
        };

        Ok(ExecutionOutput {
            breaches: probe.breaches(),
            fault_signature,
            result,
        })
    }
}

/// Build the engine, bind the bridge, evaluate, and map the outcome.
///
/// Runs on the blocking pool; everything it touches is owned by this
/// execution except the bridge store.
fn run_script(
    source: &str,
    limits: &ExecutionLimits,
    bridge: &HostBridge,
    probe: &ExecutionProbe,
    args: serde_json::Value,
    cancel: &CancellationToken,
) -> ExecutionResult {
    let mut engine = CapabilityCompiler::capability_engine(limits);
    bridge.attach(&mut engine, probe);

    let ops_seen = Arc::new(AtomicU64::new(0));
    let deadline = Instant::now() + Duration::from_millis(limits.timeout_ms);
    {
        let ops_seen = Arc::clone(&ops_seen);
        let cancel = cancel.clone();
        engine.on_progress(move |ops| {
            ops_seen.store(ops, Ordering::Relaxed);
            if ops & PROGRESS_CHECK_MASK == 0 {
                if cancel.is_cancelled() {
                    return Some("cancelled".into());
                }
                if Instant::now() >= deadline {
                    return Some("timeout".into());
                }
            }
            None
        });
    }

    let ast = match engine.compile(source) {
        Ok(ast) => ast,
        // Validated source always parses; reaching this means the stored
        // source drifted from its validation outcome.
        Err(err) => {
            return ExecutionResult::error(
                format!("stored source no longer compiles: {err}"),
                ResourceUsage::default(),
                probe.calls(),
            )
        }
    };

    let args_dynamic = match rhai::serde::to_dynamic(&args) {
        Ok(d) => d,
        Err(err) => {
            return ExecutionResult::error(
                format!("arguments cannot cross into the sandbox: {err}"),
                ResourceUsage::default(),
                probe.calls(),
            )
        }
    };

    let mut scope = Scope::new();
    scope.push_constant_dynamic("args", args_dynamic);

    let started = Instant::now();
    let outcome = engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast);
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let operations = ops_seen.load(Ordering::Relaxed);
    let budget = limits.max_operations();
    let usage = |memory: u64| ResourceUsage {
        elapsed_ms,
        operations,
        memory_bytes_est: memory,
        cpu_share: (operations as f64 / budget as f64).min(1.0),
    };

    match outcome {
        Ok(value) => {
            let memory = estimate_size(&value);
            let output = dynamic_to_json(&value);

            // Staged writes commit only on a clean completion.
            let journal = probe.take_journal();
            let staged = journal.len();
            for record in journal {
                if let Err(err) = bridge.store().insert_record(record) {
                    warn!(error = %err, "failed to commit staged writes");
                    return ExecutionResult::error(
                        format!("failed to commit {staged} staged writes: {err}"),
                        usage(memory),
                        probe.calls(),
                    );
                }
            }

            debug!(elapsed_ms, operations, "execution completed");
            ExecutionResult::success(output, usage(memory), probe.calls())
        }
        Err(err) => map_eval_error(err, limits, usage(0), probe),
    }
}

fn map_eval_error(
    err: Box<EvalAltResult>,
    limits: &ExecutionLimits,
    usage: ResourceUsage,
    probe: &ExecutionProbe,
) -> ExecutionResult {
    let calls = probe.calls();
    match *err {
        EvalAltResult::ErrorTerminated(ref token, _) => {
            let flag = token.clone().into_string().unwrap_or_default();
            if flag == "cancelled" {
                ExecutionResult::error("execution cancelled by caller", usage, calls)
            } else {
                ExecutionResult::violation(
                    SandboxViolationKind::TimeoutExceeded,
                    format!("wall-clock timeout of {}ms exceeded", limits.timeout_ms),
                    usage,
                    calls,
                )
            }
        }
        EvalAltResult::ErrorTooManyOperations(_) => ExecutionResult::violation(
            SandboxViolationKind::CpuExceeded,
            format!("operation budget of {} exceeded", limits.max_operations()),
            usage,
            calls,
        ),
        EvalAltResult::ErrorDataTooLarge(ref what, _) => ExecutionResult::violation(
            SandboxViolationKind::MemoryExceeded,
            format!(
                "{what} exceeds the {} byte memory ceiling",
                limits.memory_limit_bytes
            ),
            usage,
            calls,
        ),
        EvalAltResult::ErrorFunctionNotFound(ref name, _) => ExecutionResult::violation(
            SandboxViolationKind::DisallowedRuntimeCall,
            format!("call to unregistered function: {name}"),
            usage,
            calls,
        ),
        ref other => ExecutionResult::error(other.to_string(), usage, calls),
    }
}

/// Stable dedup key for a runtime fault: the first line, truncated.
fn fault_signature(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or_default();
    first_line.chars().take(80).collect()
}

/// Rough byte estimate of a script value, for usage reporting.
fn estimate_size(value: &Dynamic) -> u64 {
    if value.is_string() {
        24 + value.clone().into_string().map(|s| s.len() as u64).unwrap_or(0)
    } else if value.is_array() {
        let arr: rhai::Array = value.clone().into_array().unwrap_or_default();
        16 + arr.iter().map(estimate_size).sum::<u64>()
    } else if value.is_map() {
        let map: rhai::Map = value.clone().cast();
        16 + map
            .iter()
            .map(|(k, v)| k.len() as u64 + estimate_size(v))
            .sum::<u64>()
    } else {
        16
    }
}

/// Convert a script value to JSON.
pub fn dynamic_to_json(value: &Dynamic) -> serde_json::Value {
    if value.is_string() {
        serde_json::Value::String(value.clone().into_string().unwrap_or_default())
    } else if value.is_int() {
        serde_json::Value::Number(serde_json::Number::from(value.clone().as_int().unwrap_or(0)))
    } else if value.is_float() {
        serde_json::json!(value.clone().as_float().unwrap_or(0.0))
    } else if value.is_bool() {
        serde_json::Value::Bool(value.clone().as_bool().unwrap_or(false))
    } else if value.is_array() {
        let arr: Vec<Dynamic> = value.clone().into_array().unwrap_or_default();
        serde_json::Value::Array(arr.iter().map(dynamic_to_json).collect())
    } else if value.is_map() {
        let map: rhai::Map = value.clone().cast();
        let mut json_map = serde_json::Map::new();
        for (k, v) in map.iter() {
            json_map.insert(k.to_string(), dynamic_to_json(v));
        }
        serde_json::Value::Object(json_map)
    } else if value.is_unit() {
        serde_json::Value::Null
    } else {
        serde_json::Value::String(format!("{value:?}"))
    }
}

// ============================================================================
// Tests
// ============================================================================
