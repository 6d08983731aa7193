use serde::Serialize;

use super::ValueType;

/// Prometheus' default histogram bucket bounds.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// A numeric value flowing into or out of the store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }

    /// Floats truncate toward zero, saturating at the i64 range.
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i64(self) -> i64 {
        match self {
            Number::Int(v) => v,
            Number::Float(v) => v as i64,
        }
    }
}

impl std::fmt::Display for Number {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Number::Int(v) => write!(f, "{v}"),
            Number::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Read-modify-write operations a gauge supports besides plain set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpdateError {
    #[error("metric '{metric}' takes {expected} label value(s), got {got}")]
    LabelArity {
        metric: String,
        expected: usize,
        got: usize,
    },
    #[error("integer division by zero updating metric '{0}'")]
    DivisionByZero(String),
    #[error("metric '{metric}' does not support {operation}")]
    Unsupported {
        metric: String,
        operation: &'static str,
    },
}

/// Histogram state: per-bucket counts (not cumulative), with a final
/// overflow bucket for values above the last bound.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Buckets {
    pub bounds: Vec<f64>,
    pub counts: Vec<u64>,
    pub count: u64,
    pub sum: f64,
}

impl Buckets {
    pub fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            counts: vec![0; bounds.len() + 1],
            count: 0,
            sum: 0.0,
        }
    }

    pub fn observe(&mut self, value: f64) {
        let idx = self.bounds.partition_point(|&b| b < value);
        if let Some(slot) = self.counts.get_mut(idx) {
            *slot += 1;
        }
        self.count += 1;
        self.sum += value;
    }
}

/// The value held by one (metric, label tuple) entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Datum {
    Int(i64),
    Float(f64),
    Buckets(Buckets),
}

impl Datum {
    pub fn zero(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Int => Datum::Int(0),
            ValueType::Float => Datum::Float(0.0),
        }
    }

    /// The scalar value, or `None` for histograms.
    pub fn number(&self) -> Option<Number> {
        match self {
            Datum::Int(v) => Some(Number::Int(*v)),
            Datum::Float(v) => Some(Number::Float(*v)),
            Datum::Buckets(_) => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub(super) fn widen(&mut self) {
        if let Datum::Int(v) = *self {
            *self = Datum::Float(v as f64);
        }
    }

    pub(super) fn add(&mut self, delta: Number) {
        match self {
            Datum::Int(v) => *v = v.wrapping_add(delta.as_i64()),
            Datum::Float(v) => *v += delta.as_f64(),
            Datum::Buckets(b) => b.observe(delta.as_f64()),
        }
    }

    pub(super) fn set(&mut self, value: Number) {
        match self {
            Datum::Int(v) => *v = value.as_i64(),
            Datum::Float(v) => *v = value.as_f64(),
            Datum::Buckets(b) => b.observe(value.as_f64()),
        }
    }

    /// Apply `self = self <op> value`. Returns false, leaving the value
    /// untouched, on integer division by zero.
    pub(super) fn apply(&mut self, op: ArithOp, value: Number) -> bool {
        match self {
            Datum::Int(v) => {
                let rhs = value.as_i64();
                *v = match op {
                    ArithOp::Add => v.wrapping_add(rhs),
                    ArithOp::Sub => v.wrapping_sub(rhs),
                    ArithOp::Mul => v.wrapping_mul(rhs),
                    ArithOp::Div | ArithOp::Mod if rhs == 0 => return false,
                    ArithOp::Div => v.wrapping_div(rhs),
                    ArithOp::Mod => v.wrapping_rem(rhs),
                };
            }
            Datum::Float(v) => {
                let rhs = value.as_f64();
                *v = match op {
                    ArithOp::Add => *v + rhs,
                    ArithOp::Sub => *v - rhs,
                    ArithOp::Mul => *v * rhs,
                    ArithOp::Div => *v / rhs,
                    ArithOp::Mod => *v % rhs,
                };
            }
            Datum::Buckets(_) => return false,
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn int_arithmetic_wraps() {
        let mut d = Datum::Int(i64::MAX);
        d.add(Number::Int(1));
        assert_eq!(d, Datum::Int(i64::MIN));
    }

    #[test]
    fn float_update_into_int_truncates() {
        let mut d = Datum::Int(10);
        d.add(Number::Float(2.9));
        assert_eq!(d, Datum::Int(12));
    }

    #[test]
    fn integer_division_by_zero_is_rejected() {
        let mut d = Datum::Int(7);
        assert!(!d.apply(ArithOp::Div, Number::Int(0)));
        assert_eq!(d, Datum::Int(7));
        assert!(d.apply(ArithOp::Mod, Number::Int(4)));
        assert_eq!(d, Datum::Int(3));
    }

    #[test]
    fn float_division_by_zero_follows_ieee() {
        let mut d = Datum::Float(1.0);
        assert!(d.apply(ArithOp::Div, Number::Float(0.0)));
        assert_eq!(d, Datum::Float(f64::INFINITY));
    }

    #[test]
    fn histogram_buckets_by_upper_bound() {
        let mut b = Buckets::new(&[1.0, 5.0]);
        b.observe(0.5);
        b.observe(1.0);
        b.observe(3.0);
        b.observe(100.0);
        assert_eq!(b.counts, vec![2, 1, 1]);
        assert_eq!(b.count, 4);
        assert_eq!(b.sum, 104.5);
    }

    #[test]
    fn widen_converts_ints_only() {
        let mut d = Datum::Int(4);
        d.widen();
        assert_eq!(d, Datum::Float(4.0));
        d.set(Number::Int(7));
        assert_eq!(d, Datum::Float(7.0));
    }
}
