//! Host bridge — the only channel through which sandboxed code can observe
//! or affect anything outside itself
//!
//! The callable set is fixed when the execution engine is built; nothing is
//! dispatched by name against a live environment, and nothing is
//! discoverable or extensible from inside a script. Every function
//! validates its own arguments and re-checks ownership against the
//! invoking caller. Writes are journaled per execution and only committed
//! after a clean run.
//!
//! Bridge functions never raise into the script: results cross the
//! boundary as `#{ ok: true, value: .. }` / `#{ ok: false, err: .. }` maps.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use rhai::{Dynamic, Engine, ImmutableString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::executor::dynamic_to_json;
use crate::types::{BridgeCall, UserId};

/// The complete set of functions callable from inside the sandbox.
///
/// Doubles as the namespace-audit hook: tests assert the compiled engine
/// exposes exactly these names beyond the whitelisted primitives.
pub const BRIDGE_FUNCTIONS: &[&str] = &[
    "fetch_records",
    "count_records",
    "save_record",
    "weighted_score",
    "days_between",
];

/// Longest accepted record label.
const MAX_LABEL_LEN: usize = 256;

// ============================================================================
// Errors and data
// ============================================================================

/// Errors produced by bridge functions.
///
/// Returned to the tool as a domain error; an ownership mismatch is
/// additionally surfaced to the audit engine by the executor.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("ownership mismatch: caller {caller} requested data of {requested}")]
    OwnershipMismatch { caller: UserId, requested: String },

    #[error("store error: {0}")]
    Store(String),
}

/// A domain record owned by a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub owner: UserId,
    pub label: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Host-side data access used by the bridge.
///
/// The host application implements this against its relational store; the
/// bridge only ever touches it through these two operations, both scoped to
/// one owner.
pub trait BridgeStore: Send + Sync {
    fn records_for(&self, owner: &UserId) -> Result<Vec<Record>, BridgeError>;
    fn insert_record(&self, record: Record) -> Result<(), BridgeError>;
}

/// In-memory store for tests and examples.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: std::sync::RwLock<Vec<Record>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records, for assertions in tests.
    pub fn all_records(&self) -> Vec<Record> {
        self.records
            .read()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl BridgeStore for InMemoryStore {
    fn records_for(&self, owner: &UserId) -> Result<Vec<Record>, BridgeError> {
        let records = self
            .records
            .read()
            .map_err(|_| BridgeError::Store("store lock poisoned".to_string()))?;
        Ok(records.iter().filter(|r| &r.owner == owner).cloned().collect())
    }

    fn insert_record(&self, record: Record) -> Result<(), BridgeError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| BridgeError::Store("store lock poisoned".to_string()))?;
        records.push(record);
        Ok(())
    }
}

// ============================================================================
// Per-execution probe
// ============================================================================

/// Shared per-execution state threaded into every bridge closure: the call
/// trace, the staged-write journal, and any ownership breaches observed.
#[derive(Debug, Clone)]
pub struct ExecutionProbe {
    pub caller: UserId,
    calls: Arc<Mutex<Vec<BridgeCall>>>,
    journal: Arc<Mutex<Vec<Record>>>,
    breaches: Arc<Mutex<Vec<String>>>,
}

impl ExecutionProbe {
    pub fn new(caller: UserId) -> Self {
        Self {
            caller,
            calls: Arc::new(Mutex::new(Vec::new())),
            journal: Arc::new(Mutex::new(Vec::new())),
            breaches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record_call(&self, call: BridgeCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn stage_write(&self, record: Record) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(record);
        }
    }

    fn note_breach(&self, requested: &str) {
        if let Ok(mut breaches) = self.breaches.lock() {
            breaches.push(requested.to_string());
        }
    }

    /// Bridge calls made so far, in order.
    pub fn calls(&self) -> Vec<BridgeCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Staged writes, draining the journal.
    pub fn take_journal(&self) -> Vec<Record> {
        self.journal
            .lock()
            .map(|mut j| std::mem::take(&mut *j))
            .unwrap_or_default()
    }

    /// Owner ids of attempted cross-user accesses.
    pub fn breaches(&self) -> Vec<String> {
        self.breaches.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

// ============================================================================
// HostBridge
// ============================================================================

/// The closed set of host functions, bound to a store implementation.
#[derive(Clone)]
pub struct HostBridge {
    store: Arc<dyn BridgeStore>,
}

impl HostBridge {
    pub fn new(store: Arc<dyn BridgeStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn BridgeStore> {
        Arc::clone(&self.store)
    }

    /// Names of all callable bridge functions.
    pub fn functions() -> &'static [&'static str] {
        BRIDGE_FUNCTIONS
    }

    /// Register every bridge function on an execution engine.
    ///
    /// Called once per execution with that execution's probe; the probe's
    /// caller identity is the last line of defense against a
    /// validated-but-malicious tool reaching another user's data.
    pub fn attach(&self, engine: &mut Engine, probe: &ExecutionProbe) {
        self.attach_fetch_records(engine, probe.clone());
        self.attach_count_records(engine, probe.clone());
        self.attach_save_record(engine, probe.clone());
        Self::attach_weighted_score(engine, probe.clone());
        Self::attach_days_between(engine, probe.clone());
    }

    fn attach_fetch_records(&self, engine: &mut Engine, probe: ExecutionProbe) {
        let store = Arc::clone(&self.store);
        engine.register_fn("fetch_records", move |owner: ImmutableString| -> rhai::Map {
            let started = Instant::now();
            let result = guard_owner(&probe, owner.as_str())
                .and_then(|_| store.records_for(&probe.caller))
                .map(records_to_dynamic);
            finish_call(
                &probe,
                "fetch_records",
                serde_json::json!({ "owner": owner.as_str() }),
                started,
                result,
            )
        });
    }

    fn attach_count_records(&self, engine: &mut Engine, probe: ExecutionProbe) {
        let store = Arc::clone(&self.store);
        engine.register_fn("count_records", move |owner: ImmutableString| -> rhai::Map {
            let started = Instant::now();
            let result = guard_owner(&probe, owner.as_str())
                .and_then(|_| store.records_for(&probe.caller))
                .map(|records| Dynamic::from(records.len() as i64));
            finish_call(
                &probe,
                "count_records",
                serde_json::json!({ "owner": owner.as_str() }),
                started,
                result,
            )
        });
    }

    fn attach_save_record(&self, engine: &mut Engine, probe: ExecutionProbe) {
        engine.register_fn(
            "save_record",
            move |owner: ImmutableString, record: rhai::Map| -> rhai::Map {
                let started = Instant::now();
                let input = serde_json::json!({
                    "owner": owner.as_str(),
                    "record": dynamic_to_json(&Dynamic::from(record.clone())),
                });
                let result = guard_owner(&probe, owner.as_str())
                    .and_then(|_| parse_record(&probe.caller, &record))
                    .map(|rec| {
                        probe.stage_write(rec);
                        Dynamic::from(true)
                    });
                finish_call(&probe, "save_record", input, started, result)
            },
        );
    }

    fn attach_weighted_score(engine: &mut Engine, probe: ExecutionProbe) {
        engine.register_fn(
            "weighted_score",
            move |values: rhai::Array, weights: rhai::Array| -> rhai::Map {
                let started = Instant::now();
                let input = serde_json::json!({
                    "values": values.iter().map(dynamic_to_json).collect::<Vec<_>>(),
                    "weights": weights.iter().map(dynamic_to_json).collect::<Vec<_>>(),
                });
                let result = weighted_score(&values, &weights).map(Dynamic::from);
                finish_call(&probe, "weighted_score", input, started, result)
            },
        );
    }

    fn attach_days_between(engine: &mut Engine, probe: ExecutionProbe) {
        engine.register_fn(
            "days_between",
            move |a: ImmutableString, b: ImmutableString| -> rhai::Map {
                let started = Instant::now();
                let input = serde_json::json!({ "a": a.as_str(), "b": b.as_str() });
                let result = days_between(a.as_str(), b.as_str()).map(Dynamic::from);
                finish_call(&probe, "days_between", input, started, result)
            },
        );
    }
}

// ============================================================================
// Function bodies
// ============================================================================

/// Re-check that the data being accessed belongs to the invoking caller.
fn guard_owner(probe: &ExecutionProbe, requested: &str) -> Result<(), BridgeError> {
    if requested == probe.caller.as_str() {
        return Ok(());
    }
    probe.note_breach(requested);
    warn!(
        caller = %probe.caller,
        requested,
        "bridge call attempted cross-user access"
    );
    Err(BridgeError::OwnershipMismatch {
        caller: probe.caller.clone(),
        requested: requested.to_string(),
    })
}

fn parse_record(caller: &UserId, map: &rhai::Map) -> Result<Record, BridgeError> {
    let label = map
        .get("label")
        .and_then(|d| d.clone().into_string().ok())
        .ok_or_else(|| BridgeError::InvalidArgument("record.label must be a string".to_string()))?;
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return Err(BridgeError::InvalidArgument(format!(
            "record.label must be 1-{MAX_LABEL_LEN} characters"
        )));
    }

    let value_dyn = map
        .get("value")
        .ok_or_else(|| BridgeError::InvalidArgument("record.value is required".to_string()))?;
    let value = numeric(value_dyn)
        .ok_or_else(|| BridgeError::InvalidArgument("record.value must be numeric".to_string()))?;
    if !value.is_finite() {
        return Err(BridgeError::InvalidArgument(
            "record.value must be finite".to_string(),
        ));
    }

    Ok(Record {
        owner: caller.clone(),
        label,
        value,
        recorded_at: Utc::now(),
    })
}

fn weighted_score(values: &rhai::Array, weights: &rhai::Array) -> Result<f64, BridgeError> {
    if values.is_empty() || values.len() != weights.len() {
        return Err(BridgeError::InvalidArgument(
            "values and weights must be non-empty and equal in length".to_string(),
        ));
    }
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;
    for (v, w) in values.iter().zip(weights.iter()) {
        let v = numeric(v)
            .ok_or_else(|| BridgeError::InvalidArgument("values must be numeric".to_string()))?;
        let w = numeric(w)
            .ok_or_else(|| BridgeError::InvalidArgument("weights must be numeric".to_string()))?;
        if w < 0.0 {
            return Err(BridgeError::InvalidArgument(
                "weights must be non-negative".to_string(),
            ));
        }
        weighted_sum += v * w;
        weight_sum += w;
    }
    if weight_sum == 0.0 {
        return Err(BridgeError::InvalidArgument(
            "weights must not all be zero".to_string(),
        ));
    }
    Ok(weighted_sum / weight_sum)
}

fn days_between(a: &str, b: &str) -> Result<i64, BridgeError> {
    let parse = |s: &str| -> Result<NaiveDate, BridgeError> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.date_naive())
            .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
            .map_err(|_| {
                BridgeError::InvalidArgument(format!(
                    "'{s}' is not an RFC 3339 timestamp or YYYY-MM-DD date"
                ))
            })
    };
    let a = parse(a)?;
    let b = parse(b)?;
    Ok((b - a).num_days())
}

fn numeric(d: &Dynamic) -> Option<f64> {
    if d.is_float() {
        d.as_float().ok()
    } else if d.is_int() {
        d.as_int().ok().map(|i| i as f64)
    } else {
        None
    }
}

fn records_to_dynamic(records: Vec<Record>) -> Dynamic {
    let array: rhai::Array = records
        .into_iter()
        .map(|r| {
            let mut map = rhai::Map::new();
            map.insert("label".into(), Dynamic::from(r.label));
            map.insert("value".into(), Dynamic::from(r.value));
            map.insert("recorded_at".into(), Dynamic::from(r.recorded_at.to_rfc3339()));
            Dynamic::from(map)
        })
        .collect();
    Dynamic::from(array)
}

/// Record the call in the trace and shape the result for the script.
fn finish_call(
    probe: &ExecutionProbe,
    name: &str,
    input: serde_json::Value,
    started: Instant,
    result: Result<Dynamic, BridgeError>,
) -> rhai::Map {
    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(value) => {
            probe.record_call(BridgeCall::new(
                name,
                input,
                format!("{value:?}"),
                true,
                duration_ms,
            ));
            let mut map = rhai::Map::new();
            map.insert("ok".into(), Dynamic::from(true));
            map.insert("value".into(), value);
            map
        }
        Err(err) => {
            probe.record_call(BridgeCall::new(
                name,
                input,
                err.to_string(),
                false,
                duration_ms,
            ));
            let mut map = rhai::Map::new();
            map.insert("ok".into(), Dynamic::from(false));
            map.insert("err".into(), Dynamic::from(err.to_string()));
            map
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_with_store() -> (HostBridge, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (HostBridge::new(store.clone() as Arc<dyn BridgeStore>), store)
    }

    fn attach_all(bridge: &HostBridge, probe: &ExecutionProbe) -> Engine {
        let mut engine = Engine::new_raw();
        bridge.attach(&mut engine, probe);
        engine
    }

    #[test]
    fn test_fetch_scoped_to_caller() {
        let (bridge, store) = bridge_with_store();
        store
            .insert_record(Record {
                owner: UserId::from("alice"),
                label: "run".to_string(),
                value: 5.0,
                recorded_at: Utc::now(),
            })
            .unwrap();
        store
            .insert_record(Record {
                owner: UserId::from("mallory"),
                label: "other".to_string(),
                value: 9.0,
                recorded_at: Utc::now(),
            })
            .unwrap();

        let probe = ExecutionProbe::new(UserId::from("alice"));
        let engine = attach_all(&bridge, &probe);

        let result: rhai::Map = engine.eval(r#"fetch_records("alice")"#).unwrap();
        assert_eq!(result["ok"].as_bool().unwrap(), true);
        let records: rhai::Array = result["value"].clone().into_array().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_ownership_mismatch_flagged() {
        let (bridge, _store) = bridge_with_store();
        let probe = ExecutionProbe::new(UserId::from("alice"));
        let engine = attach_all(&bridge, &probe);

        let result: rhai::Map = engine.eval(r#"fetch_records("mallory")"#).unwrap();
        assert_eq!(result["ok"].as_bool().unwrap(), false);
        assert_eq!(probe.breaches(), vec!["mallory".to_string()]);

        let calls = probe.calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].success);
    }

    #[test]
    fn test_save_record_staged_not_committed() {
        let (bridge, store) = bridge_with_store();
        let probe = ExecutionProbe::new(UserId::from("alice"));
        let engine = attach_all(&bridge, &probe);

        let result: rhai::Map = engine
            .eval(r#"save_record("alice", #{ label: "jog", value: 3.5 })"#)
            .unwrap();
        assert_eq!(result["ok"].as_bool().unwrap(), true);

        // journaled, not in the store
        assert!(store.all_records().is_empty());
        let journal = probe.take_journal();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].label, "jog");
        assert_eq!(journal[0].owner, UserId::from("alice"));
    }

    #[test]
    fn test_save_record_validates_arguments() {
        let (bridge, _store) = bridge_with_store();
        let probe = ExecutionProbe::new(UserId::from("alice"));
        let engine = attach_all(&bridge, &probe);

        let result: rhai::Map = engine
            .eval(r#"save_record("alice", #{ value: 1.0 })"#)
            .unwrap();
        assert_eq!(result["ok"].as_bool().unwrap(), false);

        let result: rhai::Map = engine
            .eval(r#"save_record("alice", #{ label: "x", value: "nope" })"#)
            .unwrap();
        assert_eq!(result["ok"].as_bool().unwrap(), false);
    }

    #[test]
    fn test_weighted_score() {
        assert_eq!(
            weighted_score(
                &vec![Dynamic::from(10.0), Dynamic::from(20.0)],
                &vec![Dynamic::from(1.0), Dynamic::from(3.0)],
            )
            .unwrap(),
            17.5
        );

        assert!(weighted_score(&vec![], &vec![]).is_err());
        assert!(weighted_score(
            &vec![Dynamic::from(1.0)],
            &vec![Dynamic::from(0.0)]
        )
        .is_err());
        assert!(weighted_score(
            &vec![Dynamic::from(1.0)],
            &vec![Dynamic::from(-1.0)]
        )
        .is_err());
    }

    #[test]
    fn test_days_between() {
        assert_eq!(days_between("2024-01-01", "2024-01-31").unwrap(), 30);
        assert_eq!(
            days_between("2024-01-31T10:00:00Z", "2024-01-01T00:00:00Z").unwrap(),
            -30
        );
        assert!(days_between("not-a-date", "2024-01-01").is_err());
    }

    #[test]
    fn test_bridge_function_list_matches_registrations() {
        let (bridge, _store) = bridge_with_store();
        let probe = ExecutionProbe::new(UserId::from("alice"));
        let engine = attach_all(&bridge, &probe);

        // every listed function is callable
        let scripts = [
            r#"fetch_records("alice")"#,
            r#"count_records("alice")"#,
            r#"save_record("alice", #{ label: "a", value: 1 })"#,
            r#"weighted_score([1.0], [1.0])"#,
            r#"days_between("2024-01-01", "2024-01-02")"#,
        ];
        for script in scripts {
            let result: rhai::Map = engine.eval(script).unwrap();
            assert_eq!(result["ok"].as_bool().unwrap(), true, "script: {script}");
        }
    }
}
