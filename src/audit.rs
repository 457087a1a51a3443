//! Security audit trail and risk scoring
//!
//! Every validation failure, sandbox violation, and limit breach lands here
//! as a structured event. The sink is append-only and must never fail
//! silently: when it is unavailable the triggering operation fails closed.
//! Risk scores aggregate recent event severity per user; enough
//! high/critical events inside the window auto-disables all of that user's
//! enabled tools.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{error, info};

use crate::config::RiskPolicy;
use crate::types::{EventId, RiskScore, SecurityEvent, Severity, UserId};

/// The audit store is unreachable; the triggering operation must fail.
#[derive(Debug, Clone, Error)]
#[error("audit append failed: {0}")]
pub struct AuditError(pub String);

/// Append-only destination for security events.
///
/// Implemented by the host against durable storage; an in-memory store is
/// provided for tests and embedded use.
pub trait AuditSink: Send + Sync {
    fn append(&self, event: &SecurityEvent) -> Result<(), AuditError>;

    /// Events matching the filter, in append order.
    fn query(&self, filter: &EventFilter) -> Result<Vec<SecurityEvent>, AuditError>;
}

/// Filter for querying recorded events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub user: Option<UserId>,
    pub min_severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(mut self, user: UserId) -> Self {
        self.user = Some(user);
        self
    }

    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.since = Some(at);
        self
    }

    pub fn until(mut self, at: DateTime<Utc>) -> Self {
        self.until = Some(at);
        self
    }

    fn matches(&self, event: &SecurityEvent) -> bool {
        if let Some(user) = &self.user {
            if &event.user != user {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if event.severity < min {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.at > until {
                return false;
            }
        }
        true
    }
}

/// In-memory append-only event store.
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    events: RwLock<Vec<SecurityEvent>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for InMemoryAuditStore {
    fn append(&self, event: &SecurityEvent) -> Result<(), AuditError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| AuditError("audit store lock poisoned".to_string()))?;
        events.push(event.clone());
        Ok(())
    }

    fn query(&self, filter: &EventFilter) -> Result<Vec<SecurityEvent>, AuditError> {
        let events = self
            .events
            .read()
            .map_err(|_| AuditError("audit store lock poisoned".to_string()))?;
        Ok(events.iter().filter(|e| filter.matches(e)).cloned().collect())
    }
}

// ============================================================================
// Risk engine
// ============================================================================

/// Weight of one event toward the risk score.
fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 1.0,
        Severity::Medium => 5.0,
        Severity::High => 20.0,
        Severity::Critical => 50.0,
    }
}

/// Instruction to auto-disable all of a user's enabled tools.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoDisable {
    pub user: UserId,
    /// High/critical events that triggered the decision.
    pub contributing: Vec<EventId>,
}

#[derive(Debug, Clone)]
struct RiskEntry {
    id: EventId,
    severity: Severity,
    at: DateTime<Utc>,
}

/// Per-user incremental risk aggregation over a rolling window.
#[derive(Debug)]
pub struct RiskEngine {
    policy: RiskPolicy,
    entries: Mutex<HashMap<UserId, VecDeque<RiskEntry>>>,
}

impl RiskEngine {
    pub fn new(policy: RiskPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fold a new event into the user's window.
    ///
    /// Returns an auto-disable instruction when the high/critical count
    /// inside the window reaches the configured limit.
    pub fn note(&self, event: &SecurityEvent) -> Option<AutoDisable> {
        let cutoff = event.at - Duration::hours(self.policy.window_hours);
        let mut entries = self.entries.lock().ok()?;
        let window = entries.entry(event.user.clone()).or_default();
        while window.front().map_or(false, |e| e.at < cutoff) {
            window.pop_front();
        }
        window.push_back(RiskEntry {
            id: event.id,
            severity: event.severity,
            at: event.at,
        });

        let contributing: Vec<EventId> = window
            .iter()
            .filter(|e| e.severity >= Severity::High)
            .map(|e| e.id)
            .collect();
        if contributing.len() >= self.policy.high_critical_limit {
            info!(user = %event.user, events = contributing.len(), "risk threshold crossed");
            return Some(AutoDisable {
                user: event.user.clone(),
                contributing,
            });
        }
        None
    }

    /// Current aggregate score for a user.
    pub fn score(&self, user: &UserId) -> RiskScore {
        self.score_at(user, Utc::now())
    }

    fn score_at(&self, user: &UserId, now: DateTime<Utc>) -> RiskScore {
        let cutoff = now - Duration::hours(self.policy.window_hours);
        let entries = self.entries.lock().ok();
        let (score, contributing) = entries
            .as_ref()
            .and_then(|e| e.get(user))
            .map(|window| {
                let live: Vec<&RiskEntry> =
                    window.iter().filter(|e| e.at >= cutoff).collect();
                let score = live.iter().map(|e| severity_weight(e.severity)).sum();
                let ids = live.iter().map(|e| e.id).collect();
                (score, ids)
            })
            .unwrap_or((0.0, Vec::new()));
        RiskScore {
            user: user.clone(),
            score,
            contributing,
            computed_at: now,
        }
    }
}

// ============================================================================
// Repeat-fault tracking
// ============================================================================

/// Detects the same runtime fault recurring from one user inside a short
/// window - a probe pattern, not an accident.
#[derive(Debug)]
pub struct FaultTracker {
    window: Duration,
    threshold: usize,
    faults: Mutex<HashMap<(UserId, String), VecDeque<DateTime<Utc>>>>,
}

impl FaultTracker {
    pub fn new(policy: &RiskPolicy) -> Self {
        Self {
            window: Duration::minutes(policy.fault_window_minutes),
            threshold: policy.repeat_fault_threshold.max(1),
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Note one fault occurrence. True exactly when the occurrence crosses
    /// the repeat threshold.
    pub fn note(&self, user: &UserId, signature: &str) -> bool {
        self.note_at(user, signature, Utc::now())
    }

    fn note_at(&self, user: &UserId, signature: &str, now: DateTime<Utc>) -> bool {
        let cutoff = now - self.window;
        let Ok(mut faults) = self.faults.lock() else {
            return false;
        };
        let window = faults
            .entry((user.clone(), signature.to_string()))
            .or_default();
        while window.front().map_or(false, |at| *at < cutoff) {
            window.pop_front();
        }
        window.push_back(now);
        window.len() == self.threshold
    }
}

// ============================================================================
// Audit log facade
// ============================================================================

/// Append-only audit trail plus incremental risk scoring.
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    risk: RiskEngine,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>, policy: RiskPolicy) -> Self {
        Self {
            sink,
            risk: RiskEngine::new(policy),
        }
    }

    /// Record an event, failing closed when the sink is unavailable.
    ///
    /// Returns an auto-disable instruction when this event crosses the
    /// user's risk threshold.
    pub fn record(&self, event: SecurityEvent) -> Result<Option<AutoDisable>, AuditError> {
        if let Err(err) = self.sink.append(&event) {
            // operational alerting path: the operation that produced this
            // event must now fail closed
            error!(error = %err, kind = ?event.kind, user = %event.user, "audit append failed");
            return Err(err);
        }
        Ok(self.risk.note(&event))
    }

    pub fn risk_score(&self, user: &UserId) -> RiskScore {
        self.risk.score(user)
    }

    /// Query recorded events through the sink.
    pub fn query(&self, filter: &EventFilter) -> Result<Vec<SecurityEvent>, AuditError> {
        self.sink.query(filter)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SecurityEventKind;

    fn event(user: &str, severity: Severity) -> SecurityEvent {
        SecurityEvent::new(
            SecurityEventKind::SandboxViolation,
            severity,
            UserId::from(user),
            None,
            "test event",
        )
    }

    #[test]
    fn test_store_append_and_query() {
        let store = InMemoryAuditStore::new();
        store.append(&event("alice", Severity::Low)).unwrap();
        store.append(&event("alice", Severity::High)).unwrap();
        store.append(&event("bob", Severity::Critical)).unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(
            store
                .query(&EventFilter::new().for_user(UserId::from("alice")))
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            store
                .query(&EventFilter::new().min_severity(Severity::High))
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            store
                .query(
                    &EventFilter::new()
                        .for_user(UserId::from("alice"))
                        .min_severity(Severity::High)
                )
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_store_time_filters() {
        let store = InMemoryAuditStore::new();
        let mut old = event("alice", Severity::Low);
        old.at = Utc::now() - Duration::hours(48);
        store.append(&old).unwrap();
        store.append(&event("alice", Severity::Low)).unwrap();

        let recent = store
            .query(&EventFilter::new().since(Utc::now() - Duration::hours(1)))
            .unwrap();
        assert_eq!(recent.len(), 1);
        let older = store
            .query(&EventFilter::new().until(Utc::now() - Duration::hours(24)))
            .unwrap();
        assert_eq!(older.len(), 1);
    }

    #[test]
    fn test_risk_score_weights() {
        let engine = RiskEngine::new(RiskPolicy::default());
        let user = UserId::from("alice");
        engine.note(&event("alice", Severity::Low));
        engine.note(&event("alice", Severity::Medium));
        engine.note(&event("alice", Severity::High));

        let score = engine.score(&user);
        assert_eq!(score.score, 26.0);
        assert_eq!(score.contributing.len(), 3);
    }

    #[test]
    fn test_risk_window_expires_events() {
        let engine = RiskEngine::new(RiskPolicy::default());
        let user = UserId::from("alice");
        let mut old = event("alice", Severity::Critical);
        old.at = Utc::now() - Duration::hours(48);
        engine.note(&old);

        let score = engine.score(&user);
        assert_eq!(score.score, 0.0);
        assert!(score.contributing.is_empty());
    }

    #[test]
    fn test_auto_disable_at_threshold() {
        let policy = RiskPolicy {
            high_critical_limit: 2,
            ..Default::default()
        };
        let engine = RiskEngine::new(policy);

        assert!(engine.note(&event("alice", Severity::Critical)).is_none());
        // low events do not count toward the trigger
        assert!(engine.note(&event("alice", Severity::Low)).is_none());
        let disable = engine.note(&event("alice", Severity::High)).unwrap();
        assert_eq!(disable.user, UserId::from("alice"));
        assert_eq!(disable.contributing.len(), 2);
    }

    #[test]
    fn test_fault_tracker_threshold() {
        let policy = RiskPolicy {
            repeat_fault_threshold: 3,
            ..Default::default()
        };
        let tracker = FaultTracker::new(&policy);
        let user = UserId::from("alice");

        assert!(!tracker.note(&user, "index out of bounds"));
        assert!(!tracker.note(&user, "index out of bounds"));
        // crosses exactly once
        assert!(tracker.note(&user, "index out of bounds"));
        assert!(!tracker.note(&user, "index out of bounds"));
        // distinct faults tracked separately
        assert!(!tracker.note(&user, "division by zero"));
    }

    #[test]
    fn test_audit_log_fails_closed() {
        struct FailingSink;
        impl AuditSink for FailingSink {
            fn append(&self, _event: &SecurityEvent) -> Result<(), AuditError> {
                Err(AuditError("disk full".to_string()))
            }

            fn query(&self, _filter: &EventFilter) -> Result<Vec<SecurityEvent>, AuditError> {
                Err(AuditError("disk full".to_string()))
            }
        }

        let log = AuditLog::new(Arc::new(FailingSink), RiskPolicy::default());
        let result = log.record(event("alice", Severity::High));
        assert!(result.is_err());
    }

    #[test]
    fn test_audit_log_records_and_scores() {
        let store = Arc::new(InMemoryAuditStore::new());
        let log = AuditLog::new(store.clone(), RiskPolicy::default());

        log.record(event("alice", Severity::High)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(log.risk_score(&UserId::from("alice")).score, 20.0);
    }
}
