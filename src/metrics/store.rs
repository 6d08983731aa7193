use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::datum::{ArithOp, Buckets, Datum, Number, UpdateError};
use super::{MetricKind, MetricSpec, ValueType};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeclarationError {
    #[error("metric '{name}' is already declared as a {existing}, cannot redeclare it as a {requested}")]
    KindConflict {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },
    #[error("metric '{name}' is already declared with labels [{}], cannot redeclare it with [{}]", .existing.join(", "), .requested.join(", "))]
    LabelConflict {
        name: String,
        existing: Vec<String>,
        requested: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("metric '{0}' is not declared")]
pub struct NotFoundError(pub String);

/// Registry of declared metrics, in declaration order.
///
/// The map lock is only taken to declare or look up a metric. Updates go
/// through the metric's own entry map and then a per-entry mutex, so writers
/// to unrelated metrics or label tuples never contend.
#[derive(Default)]
pub struct MetricStore {
    metrics: RwLock<IndexMap<String, Arc<Metric>>>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a metric, or return the existing one if the declaration is
    /// identical in kind and labels. Buckets, visibility and export name of
    /// the first declaration win. A float declaration of an int metric widens
    /// it to float in place.
    pub fn declare(&self, spec: MetricSpec) -> Result<Arc<Metric>, DeclarationError> {
        if let Some(existing) = self.metrics.read().get(&spec.name) {
            existing.reconcile(&spec)?;
            return Ok(Arc::clone(existing));
        }
        let mut metrics = self.metrics.write();
        // Another declarer may have won the race between the two locks.
        if let Some(existing) = metrics.get(&spec.name) {
            existing.reconcile(&spec)?;
            return Ok(Arc::clone(existing));
        }
        let metric = Arc::new(Metric::new(spec));
        metrics.insert(metric.spec.name.clone(), Arc::clone(&metric));
        Ok(metric)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Metric>, NotFoundError> {
        self.metrics
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NotFoundError(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }

    /// Drop every entry of every metric. Declarations are kept.
    pub fn clear(&self) {
        for metric in self.metrics.read().values() {
            metric.clear();
        }
    }

    /// Point-in-time copy of the store for export. Each entry is read under
    /// its own lock, so the snapshot is consistent per entry, not globally.
    pub fn snapshot(&self, include_hidden: bool) -> Vec<MetricSnapshot> {
        let metrics: Vec<Arc<Metric>> = self.metrics.read().values().cloned().collect();
        metrics
            .iter()
            .filter(|m| include_hidden || !m.spec.hidden)
            .map(|m| m.snapshot())
            .collect()
    }
}

struct Entry {
    datum: Datum,
    updated: DateTime<Utc>,
}

/// A declared metric and its label-tuple entries.
pub struct Metric {
    spec: MetricSpec,
    /// Set once any declaration asked for float values; never cleared.
    float_values: AtomicBool,
    entries: RwLock<IndexMap<Vec<String>, Arc<Mutex<Entry>>>>,
}

impl std::fmt::Debug for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metric")
            .field("spec", &self.spec)
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

impl Metric {
    fn new(spec: MetricSpec) -> Self {
        Self {
            float_values: AtomicBool::new(spec.value_type == ValueType::Float),
            spec,
            entries: RwLock::new(IndexMap::new()),
        }
    }

    fn value_type(&self) -> ValueType {
        if self.float_values.load(Ordering::Acquire) {
            ValueType::Float
        } else {
            ValueType::Int
        }
    }

    fn reconcile(&self, spec: &MetricSpec) -> Result<(), DeclarationError> {
        if self.spec.kind != spec.kind {
            return Err(DeclarationError::KindConflict {
                name: spec.name.clone(),
                existing: self.spec.kind,
                requested: spec.kind,
            });
        }
        if self.spec.labels != spec.labels {
            return Err(DeclarationError::LabelConflict {
                name: spec.name.clone(),
                existing: self.spec.labels.clone(),
                requested: spec.labels.clone(),
            });
        }
        if spec.value_type == ValueType::Float {
            self.widen_to_float();
        }
        Ok(())
    }

    /// Switch an int metric to float values, converting existing entries.
    /// The entry map lock keeps new entries from being created as ints
    /// while the existing ones are converted.
    fn widen_to_float(&self) {
        if self.float_values.load(Ordering::Acquire) {
            return;
        }
        let entries = self.entries.write();
        if self.float_values.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(metric = %self.spec.name, entries = entries.len(), "widening metric to float values");
        for entry in entries.values() {
            entry.lock().datum.widen();
        }
    }

    fn new_datum(&self) -> Datum {
        if self.spec.kind == MetricKind::Histogram {
            Datum::Buckets(Buckets::new(&self.spec.buckets))
        } else {
            Datum::zero(self.value_type())
        }
    }

    /// Look up or create the entry for a label tuple.
    fn entry(&self, labels: &[String]) -> Result<Arc<Mutex<Entry>>, UpdateError> {
        if labels.len() != self.spec.labels.len() {
            return Err(UpdateError::LabelArity {
                metric: self.spec.name.clone(),
                expected: self.spec.labels.len(),
                got: labels.len(),
            });
        }
        if let Some(entry) = self.entries.read().get(labels) {
            return Ok(Arc::clone(entry));
        }
        let mut entries = self.entries.write();
        let entry = entries.entry(labels.to_vec()).or_insert_with(|| {
            Arc::new(Mutex::new(Entry {
                datum: self.new_datum(),
                updated: Utc::now(),
            }))
        });
        Ok(Arc::clone(entry))
    }

    fn unsupported(&self, operation: &'static str) -> UpdateError {
        UpdateError::Unsupported {
            metric: self.spec.name.clone(),
            operation,
        }
    }

    /// Add `delta` to a counter or gauge entry.
    pub fn incr(&self, labels: &[String], delta: Number, at: DateTime<Utc>) -> Result<(), UpdateError> {
        if self.spec.kind == MetricKind::Histogram {
            return Err(self.unsupported("increment"));
        }
        let entry = self.entry(labels)?;
        let mut entry = entry.lock();
        entry.datum.add(delta);
        entry.updated = at;
        Ok(())
    }

    /// Replace the value of a scalar entry.
    pub fn set(&self, labels: &[String], value: Number, at: DateTime<Utc>) -> Result<(), UpdateError> {
        if self.spec.kind == MetricKind::Histogram {
            return Err(self.unsupported("set"));
        }
        let entry = self.entry(labels)?;
        let mut entry = entry.lock();
        entry.datum.set(value);
        entry.updated = at;
        Ok(())
    }

    /// Record one histogram observation.
    pub fn observe(&self, labels: &[String], value: f64, at: DateTime<Utc>) -> Result<(), UpdateError> {
        if self.spec.kind != MetricKind::Histogram {
            return Err(self.unsupported("observe"));
        }
        let entry = self.entry(labels)?;
        let mut entry = entry.lock();
        entry.datum.set(Number::Float(value));
        entry.updated = at;
        Ok(())
    }

    /// Atomic read-modify-write of a scalar entry.
    pub fn update(
        &self,
        labels: &[String],
        op: ArithOp,
        value: Number,
        at: DateTime<Utc>,
    ) -> Result<(), UpdateError> {
        if self.spec.kind == MetricKind::Histogram {
            return Err(self.unsupported("arithmetic update"));
        }
        let entry = self.entry(labels)?;
        let mut entry = entry.lock();
        if !entry.datum.apply(op, value) {
            return Err(UpdateError::DivisionByZero(self.spec.name.clone()));
        }
        entry.updated = at;
        Ok(())
    }

    /// Current scalar value of an entry; `None` if it was never updated.
    pub fn value(&self, labels: &[String]) -> Option<Number> {
        let entry = self.entries.read().get(labels).cloned()?;
        let entry = entry.lock();
        entry.datum.number()
    }

    pub fn get(&self, labels: &[String]) -> Option<Datum> {
        let entry = self.entries.read().get(labels).cloned()?;
        let datum = entry.lock().datum.clone();
        Some(datum)
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn snapshot(&self) -> MetricSnapshot {
        let entries: Vec<(Vec<String>, Arc<Mutex<Entry>>)> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        MetricSnapshot {
            name: self.spec.name.clone(),
            export_name: self.spec.export_name.clone(),
            kind: self.spec.kind,
            value_type: self.value_type(),
            labels: self.spec.labels.clone(),
            hidden: self.spec.hidden,
            entries: entries
                .into_iter()
                .map(|(labels, entry)| {
                    let entry = entry.lock();
                    EntrySnapshot {
                        labels,
                        value: entry.datum.clone(),
                        timestamp: entry.updated,
                    }
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_name: Option<String>,
    pub kind: MetricKind,
    pub value_type: ValueType,
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
    pub entries: Vec<EntrySnapshot>,
}

impl MetricSnapshot {
    pub fn value(&self, labels: &[&str]) -> Option<&Datum> {
        self.entries
            .iter()
            .find(|e| e.labels.iter().map(String::as_str).eq(labels.iter().copied()))
            .map(|e| &e.value)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub labels: Vec<String>,
    pub value: Datum,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn declare_is_idempotent() {
        let store = MetricStore::new();
        let a = store.declare(MetricSpec::new("hits", MetricKind::Counter, labels(&["code"]))).unwrap();
        let b = store.declare(MetricSpec::new("hits", MetricKind::Counter, labels(&["code"]))).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn conflicting_kind_is_rejected() {
        let store = MetricStore::new();
        store.declare(MetricSpec::new("x", MetricKind::Counter, vec![])).unwrap();
        let err = store.declare(MetricSpec::new("x", MetricKind::Gauge, vec![])).unwrap_err();
        assert!(matches!(err, DeclarationError::KindConflict { .. }));
        assert!(err.to_string().contains("already declared as a counter"));
    }

    #[test]
    fn conflicting_labels_are_rejected() {
        let store = MetricStore::new();
        store.declare(MetricSpec::new("x", MetricKind::Counter, labels(&["a"]))).unwrap();
        let err = store.declare(MetricSpec::new("x", MetricKind::Counter, labels(&["b"]))).unwrap_err();
        assert!(matches!(err, DeclarationError::LabelConflict { .. }));
    }

    #[test]
    fn float_declaration_widens_int_metric() {
        let store = MetricStore::new();
        let ints = store.declare(MetricSpec::new("g", MetricKind::Gauge, vec![])).unwrap();
        ints.set(&[], Number::Int(3), Utc::now()).unwrap();

        let mut float_spec = MetricSpec::new("g", MetricKind::Gauge, vec![]);
        float_spec.value_type = ValueType::Float;
        let floats = store.declare(float_spec).unwrap();
        assert!(Arc::ptr_eq(&ints, &floats));
        assert_eq!(floats.get(&[]), Some(Datum::Float(3.0)));

        floats.set(&[], Number::Float(1.5), Utc::now()).unwrap();
        assert_eq!(ints.value(&[]), Some(Number::Float(1.5)));

        // A later int declaration keeps the float values.
        store.declare(MetricSpec::new("g", MetricKind::Gauge, vec![])).unwrap();
        let snap = store.snapshot(false);
        assert_eq!(snap[0].value_type, ValueType::Float);
    }

    #[test]
    fn widened_metric_creates_float_entries() {
        let store = MetricStore::new();
        let m = store.declare(MetricSpec::new("c", MetricKind::Counter, labels(&["k"]))).unwrap();
        let mut float_spec = MetricSpec::new("c", MetricKind::Counter, labels(&["k"]));
        float_spec.value_type = ValueType::Float;
        store.declare(float_spec).unwrap();
        m.incr(&labels(&["a"]), Number::Int(2), Utc::now()).unwrap();
        assert_eq!(m.get(&labels(&["a"])), Some(Datum::Float(2.0)));
    }

    #[test]
    fn get_unknown_metric() {
        let store = MetricStore::new();
        assert_eq!(store.get("nope").unwrap_err(), NotFoundError("nope".into()));
    }

    #[test]
    fn incr_creates_entries_per_label_tuple() {
        let store = MetricStore::new();
        let m = store.declare(MetricSpec::new("logins", MetricKind::Counter, labels(&["user"]))).unwrap();
        let now = Utc::now();
        m.incr(&labels(&["alice"]), Number::Int(1), now).unwrap();
        m.incr(&labels(&["bob"]), Number::Int(1), now).unwrap();
        m.incr(&labels(&["alice"]), Number::Int(1), now).unwrap();
        assert_eq!(m.value(&labels(&["alice"])), Some(Number::Int(2)));
        assert_eq!(m.value(&labels(&["bob"])), Some(Number::Int(1)));
        assert_eq!(m.snapshot().entries.len(), 2);
    }

    #[test]
    fn label_arity_is_checked() {
        let store = MetricStore::new();
        let m = store.declare(MetricSpec::new("x", MetricKind::Counter, labels(&["a", "b"]))).unwrap();
        let err = m.incr(&labels(&["only"]), Number::Int(1), Utc::now()).unwrap_err();
        assert!(matches!(err, UpdateError::LabelArity { expected: 2, got: 1, .. }));
    }

    #[test]
    fn histogram_observes_into_buckets() {
        let store = MetricStore::new();
        let mut spec = MetricSpec::new("latency", MetricKind::Histogram, vec![]);
        spec.buckets = vec![1.0, 10.0];
        let m = store.declare(spec).unwrap();
        m.observe(&[], 0.5, Utc::now()).unwrap();
        m.observe(&[], 20.0, Utc::now()).unwrap();
        let Some(Datum::Buckets(b)) = m.get(&[]) else { panic!("expected buckets") };
        assert_eq!(b.counts, vec![1, 0, 1]);
        assert!(m.incr(&[], Number::Int(1), Utc::now()).is_err());
        assert_eq!(m.value(&[]), None);
    }

    #[test]
    fn gauge_read_modify_write() {
        let store = MetricStore::new();
        let m = store.declare(MetricSpec::new("g", MetricKind::Gauge, vec![])).unwrap();
        let now = Utc::now();
        m.set(&[], Number::Int(10), now).unwrap();
        m.update(&[], ArithOp::Mul, Number::Int(3), now).unwrap();
        m.update(&[], ArithOp::Sub, Number::Int(5), now).unwrap();
        assert_eq!(m.value(&[]), Some(Number::Int(25)));
        let err = m.update(&[], ArithOp::Div, Number::Int(0), now).unwrap_err();
        assert!(matches!(err, UpdateError::DivisionByZero(_)));
        assert_eq!(m.value(&[]), Some(Number::Int(25)));
    }

    #[test]
    fn clear_drops_entries_keeps_declarations() {
        let store = MetricStore::new();
        let m = store.declare(MetricSpec::new("c", MetricKind::Counter, vec![])).unwrap();
        m.incr(&[], Number::Int(1), Utc::now()).unwrap();
        store.clear();
        assert!(m.snapshot().entries.is_empty());
        assert!(store.get("c").is_ok());
    }

    #[test]
    fn snapshot_skips_hidden_unless_asked() {
        let store = MetricStore::new();
        let mut hidden = MetricSpec::new("internal", MetricKind::Counter, vec![]);
        hidden.hidden = true;
        store.declare(hidden).unwrap();
        store.declare(MetricSpec::new("public", MetricKind::Counter, vec![])).unwrap();
        assert_eq!(store.snapshot(false).len(), 1);
        assert_eq!(store.snapshot(true).len(), 2);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let store = MetricStore::new();
        let m = store.declare(MetricSpec::new("logins", MetricKind::Counter, labels(&["user"]))).unwrap();
        m.incr(&labels(&["alice"]), Number::Int(2), Utc::now()).unwrap();
        let snap = store.snapshot(false);
        assert_eq!(snap[0].value(&["alice"]), Some(&Datum::Int(2)));
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json[0]["name"], "logins");
        assert_eq!(json[0]["kind"], "counter");
        assert_eq!(json[0]["entries"][0]["labels"][0], "alice");
        assert_eq!(json[0]["entries"][0]["value"], 2);
    }

    #[test]
    fn concurrent_increments_are_additive() {
        let store = Arc::new(MetricStore::new());
        let m = store.declare(MetricSpec::new("n", MetricKind::Counter, labels(&["k"]))).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    let key = vec![(i % 2).to_string()];
                    for _ in 0..1000 {
                        m.incr(&key, Number::Int(1), Utc::now()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.value(&labels(&["0"])), Some(Number::Int(4000)));
        assert_eq!(m.value(&labels(&["1"])), Some(Number::Int(4000)));
    }
}
