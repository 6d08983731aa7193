//! Concurrent metric store shared by every program and every source task.

mod datum;
mod store;

pub use datum::{ArithOp, Buckets, Datum, Number, UpdateError, DEFAULT_BUCKETS};
pub use store::{
    DeclarationError, EntrySnapshot, Metric, MetricSnapshot, MetricStore, NotFoundError,
};

use serde::{Deserialize, Serialize};

/// The kind of a declared metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Timer,
    Histogram,
}

impl MetricKind {
    pub fn keyword(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Timer => "timer",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Numeric representation of a metric's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
        })
    }
}

/// Everything needed to declare a metric in the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSpec {
    pub name: String,
    pub kind: MetricKind,
    pub labels: Vec<String>,
    pub value_type: ValueType,
    /// Upper bounds for histogram buckets. Empty for other kinds.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<f64>,
    pub hidden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_name: Option<String>,
}

impl MetricSpec {
    /// A visible, unaliased metric. Histograms get the default buckets.
    pub fn new(name: impl Into<String>, kind: MetricKind, labels: Vec<String>) -> Self {
        let (value_type, buckets) = if kind == MetricKind::Histogram {
            (ValueType::Float, DEFAULT_BUCKETS.to_vec())
        } else {
            (ValueType::Int, Vec::new())
        };
        Self {
            name: name.into(),
            kind,
            labels,
            value_type,
            buckets,
            hidden: false,
            export_name: None,
        }
    }
}
