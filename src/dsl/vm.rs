use std::borrow::Cow;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use super::compiler::{CmpOp, CompiledProgram, Constant, MetricOp, Op};
use super::error::Position;
use crate::metrics::{Metric, Number, UpdateError};

/// Maximum stack depth to prevent runaway programs.
const MAX_STACK: usize = 256;

/// One line of input and where it came from.
#[derive(Debug, Clone, Copy)]
pub struct LogLine<'a> {
    pub filename: &'a str,
    pub text: &'a str,
}

/// Runtime value on the VM stack. Strings borrow from the line or the
/// constant pool until an operation needs to build a new one.
#[derive(Debug, Clone)]
enum Value<'a> {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Cow<'a, str>),
}

impl Value<'_> {
    fn describe(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => format!("{s:?}"),
        }
    }

    /// Text used when the value is a label.
    fn into_label(self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s.into_owned(),
        }
    }
}

/// Why execution of a program stopped early on a line.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("negative integer exponent {0}")]
    NegativeExponent(i64),
    #[error("capture group {group} out of range for regex {regex}")]
    CaptureOutOfRange { regex: u16, group: u16 },
    #[error("capture read from regex {0} before it matched")]
    UnevaluatedRegex(u16),
    #[error("cannot convert {value} to {target}")]
    Coercion { value: String, target: &'static str },
    #[error("cannot parse time {value:?} with format {format:?}")]
    Time { value: String, format: String },
    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(i64),
    #[error("invalid base {0} (must be 2 to 36)")]
    InvalidBase(i64),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow (max {MAX_STACK})")]
    StackOverflow,
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: String },
    #[error("metric {0} is not bound")]
    UnboundMetric(u16),
    #[error("bad operand {0}")]
    BadOperand(u16),
}

/// A runtime fault, located in the program that raised it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{program}:{position}: {fault}")]
pub struct ExecutionError {
    pub program: String,
    pub position: Position,
    pub fault: Fault,
}

/// Run `program` over one line. `metrics` are the store handles for the
/// program's declared metrics, in declaration order.
///
/// Updates made before a fault are kept; the rest of the line is skipped.
pub fn execute<'a>(
    program: &'a CompiledProgram,
    metrics: &[Arc<Metric>],
    line: &LogLine<'a>,
) -> Result<(), ExecutionError> {
    let mut vm = Vm {
        program,
        metrics,
        line: *line,
        stack: Vec::with_capacity(16),
        captures: vec![None; program.regexes.len()],
        flags: vec![false; usize::from(program.flag_count)],
        timestamp: None,
        now: None,
    };
    let mut ip = 0;
    vm.run(&mut ip).map_err(|fault| ExecutionError {
        program: program.name.clone(),
        position: program.positions.get(ip).copied().unwrap_or_default(),
        fault,
    })
}

struct Vm<'a, 'm> {
    program: &'a CompiledProgram,
    metrics: &'m [Arc<Metric>],
    line: LogLine<'a>,
    stack: Vec<Value<'a>>,
    /// Groups of the latest successful match per regex. Groups that did not
    /// participate hold "".
    captures: Vec<Option<Vec<Cow<'a, str>>>>,
    flags: Vec<bool>,
    /// Set by `strptime`/`settime`.
    timestamp: Option<DateTime<Utc>>,
    now: Option<DateTime<Utc>>,
}

impl<'a> Vm<'a, '_> {
    #[allow(
        clippy::too_many_lines,
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::float_cmp
    )]
    fn run(&mut self, ip: &mut usize) -> Result<(), Fault> {
        let program = self.program;
        let ops = &program.ops;
        while let Some(&op) = ops.get(*ip) {
            if self.stack.len() >= MAX_STACK {
                return Err(Fault::StackOverflow);
            }
            let mut next = *ip + 1;

            match op {
                Op::PushConst(idx) => {
                    let value = match program.constants.get(usize::from(idx)) {
                        Some(Constant::Int(v)) => Value::Int(*v),
                        Some(Constant::Float(v)) => Value::Float(*v),
                        Some(Constant::Str(s)) => Value::Str(Cow::Borrowed(s.as_str())),
                        None => return Err(Fault::BadOperand(idx)),
                    };
                    self.stack.push(value);
                }
                Op::PushBool(b) => self.stack.push(Value::Bool(b)),
                Op::Pop => {
                    self.pop()?;
                }

                // Matching
                Op::Match(regex) => {
                    let text = self.line.text;
                    let matched = self.match_regex(regex, Cow::Borrowed(text))?;
                    self.stack.push(Value::Bool(matched));
                }
                Op::MatchValue(regex) => {
                    let subject = self.pop_str()?;
                    let matched = self.match_regex(regex, subject)?;
                    self.stack.push(Value::Bool(matched));
                }
                Op::LoadCapture { regex, group } => {
                    let groups = self
                        .captures
                        .get(usize::from(regex))
                        .ok_or(Fault::BadOperand(regex))?
                        .as_ref()
                        .ok_or(Fault::UnevaluatedRegex(regex))?;
                    let text = groups
                        .get(usize::from(group))
                        .ok_or(Fault::CaptureOutOfRange { regex, group })?
                        .clone();
                    self.stack.push(Value::Str(text));
                }

                // Metrics
                Op::LoadMetric { metric, labels } => {
                    let labels = self.pop_labels(labels)?;
                    let metric = self.metric(metric)?;
                    let value = metric.value(&labels).map_or(0.0, Number::as_f64);
                    self.stack.push(Value::Float(value));
                }
                Op::StoreMetric { metric, labels, op } => {
                    let value = if op == MetricOp::Incr {
                        Number::Int(1)
                    } else {
                        self.pop_number()?
                    };
                    let labels = self.pop_labels(labels)?;
                    let at = self.effective_time();
                    let metric = self.metric(metric)?;
                    match op {
                        MetricOp::Incr | MetricOp::Add => metric.incr(&labels, value, at)?,
                        MetricOp::Set => metric.set(&labels, value, at)?,
                        MetricOp::Observe => metric.observe(&labels, value.as_f64(), at)?,
                        MetricOp::Update(arith) => metric.update(&labels, arith, value, at)?,
                    }
                }

                // Integer arithmetic
                Op::IAdd => self.int_binop(|a, b| Ok(a.wrapping_add(b)))?,
                Op::ISub => self.int_binop(|a, b| Ok(a.wrapping_sub(b)))?,
                Op::IMul => self.int_binop(|a, b| Ok(a.wrapping_mul(b)))?,
                Op::IDiv => self.int_binop(|a, b| {
                    if b == 0 { Err(Fault::DivisionByZero) } else { Ok(a.wrapping_div(b)) }
                })?,
                Op::IMod => self.int_binop(|a, b| {
                    if b == 0 { Err(Fault::DivisionByZero) } else { Ok(a.wrapping_rem(b)) }
                })?,
                Op::IPow => self.int_binop(|a, b| {
                    let exp = u32::try_from(b).map_err(|_| Fault::NegativeExponent(b))?;
                    Ok(a.wrapping_pow(exp))
                })?,
                Op::INeg => {
                    let v = self.pop_int()?;
                    self.stack.push(Value::Int(v.wrapping_neg()));
                }

                // Float arithmetic
                Op::FAdd => self.float_binop(|a, b| a + b)?,
                Op::FSub => self.float_binop(|a, b| a - b)?,
                Op::FMul => self.float_binop(|a, b| a * b)?,
                Op::FDiv => self.float_binop(|a, b| a / b)?,
                Op::FMod => self.float_binop(|a, b| a % b)?,
                Op::FPow => self.float_binop(f64::powf)?,
                Op::FNeg => {
                    let v = self.pop_float()?;
                    self.stack.push(Value::Float(-v));
                }

                // Bitwise
                Op::BitAnd => self.int_binop(|a, b| Ok(a & b))?,
                Op::BitOr => self.int_binop(|a, b| Ok(a | b))?,
                Op::BitXor => self.int_binop(|a, b| Ok(a ^ b))?,
                Op::Shl => self.int_binop(|a, b| Ok(a.wrapping_shl(shift_amount(b))))?,
                Op::Shr => self.int_binop(|a, b| Ok(a.wrapping_shr(shift_amount(b))))?,
                Op::BitNot => {
                    let v = self.pop_int()?;
                    self.stack.push(Value::Int(!v));
                }

                Op::Concat => {
                    let b = self.pop_str()?;
                    let a = self.pop_str()?;
                    self.stack.push(Value::Str(Cow::Owned(format!("{a}{b}"))));
                }

                // Comparison
                Op::ICmp(cmp) => {
                    let b = self.pop_int()?;
                    let a = self.pop_int()?;
                    self.stack.push(Value::Bool(compare(cmp, &a, &b)));
                }
                Op::FCmp(cmp) => {
                    let b = self.pop_float()?;
                    let a = self.pop_float()?;
                    let result = match cmp {
                        CmpOp::Lt => a < b,
                        CmpOp::Gt => a > b,
                        CmpOp::Le => a <= b,
                        CmpOp::Ge => a >= b,
                        CmpOp::Eq => a == b,
                        CmpOp::Ne => a != b,
                    };
                    self.stack.push(Value::Bool(result));
                }
                Op::SCmp(cmp) => {
                    let b = self.pop_str()?;
                    let a = self.pop_str()?;
                    self.stack.push(Value::Bool(compare(cmp, &a, &b)));
                }
                Op::BCmp(cmp) => {
                    let b = self.pop_bool()?;
                    let a = self.pop_bool()?;
                    self.stack.push(Value::Bool(compare(cmp, &a, &b)));
                }
                Op::Not => {
                    let v = self.pop_bool()?;
                    self.stack.push(Value::Bool(!v));
                }

                // Type conversion
                Op::IntToFloat => {
                    let v = self.pop_int()?;
                    self.stack.push(Value::Float(v as f64));
                }
                Op::ParseInt => {
                    let s = self.pop_str()?;
                    self.stack.push(Value::Int(parse_int(&s)?));
                }
                Op::ParseFloat => {
                    let s = self.pop_str()?;
                    self.stack.push(Value::Float(parse_float(&s)?));
                }
                Op::ParseNumber => {
                    let s = self.pop_str()?;
                    let value = match parse_int(&s) {
                        Ok(i) => Value::Int(i),
                        Err(_) => Value::Float(parse_float(&s).map_err(|_| Fault::Coercion {
                            value: format!("{s:?}"),
                            target: "number",
                        })?),
                    };
                    self.stack.push(value);
                }

                // Builtins
                Op::ToInt => {
                    let v = self.pop()?;
                    let result = match v {
                        Value::Int(i) => i,
                        Value::Float(f) => f as i64,
                        Value::Bool(b) => i64::from(b),
                        Value::Str(s) => match parse_int(&s) {
                            Ok(i) => i,
                                Err(_) => parse_float(&s).map(|f| f as i64).map_err(|_| Fault::Coercion {
                                value: format!("{s:?}"),
                                target: "int",
                            })?,
                        },
                    };
                    self.stack.push(Value::Int(result));
                }
                Op::ToFloat => {
                    let v = self.pop()?;
                    let result = match v {
                            Value::Int(i) => i as f64,
                        Value::Float(f) => f,
                        Value::Bool(b) => f64::from(u8::from(b)),
                        Value::Str(s) => parse_float(&s)?,
                    };
                    self.stack.push(Value::Float(result));
                }
                Op::ToStr => {
                    let v = self.pop()?;
                    let s = match v {
                        Value::Str(s) => s,
                        other => Cow::Owned(other.into_label()),
                    };
                    self.stack.push(Value::Str(s));
                }
                Op::Strptime => {
                    let format = self.pop_str()?;
                    let value = self.pop_str()?;
                    let at = parse_time(&value, &format)?;
                    self.timestamp = Some(at);
                    self.stack.push(Value::Int(at.timestamp()));
                }
                Op::Timestamp => {
                    let at = self.effective_time();
                    self.stack.push(Value::Int(at.timestamp()));
                }
                Op::Settime => {
                    let secs = self.pop_int()?;
                    let at = DateTime::from_timestamp(secs, 0).ok_or(Fault::InvalidTimestamp(secs))?;
                    self.timestamp = Some(at);
                }
                Op::Strtol => {
                    let base = self.pop_int()?;
                    let s = self.pop_str()?;
                    let radix = u32::try_from(base)
                        .ok()
                        .filter(|b| (2..=36).contains(b))
                        .ok_or(Fault::InvalidBase(base))?;
                    let v = i64::from_str_radix(s.trim(), radix).map_err(|_| Fault::Coercion {
                        value: format!("{s:?}"),
                        target: "int",
                    })?;
                    self.stack.push(Value::Int(v));
                }
                Op::Len => {
                    let s = self.pop_str()?;
                    let len = i64::try_from(s.chars().count()).unwrap_or(i64::MAX);
                    self.stack.push(Value::Int(len));
                }
                Op::ToLower => {
                    let s = self.pop_str()?;
                    self.stack.push(Value::Str(Cow::Owned(s.to_lowercase())));
                }
                Op::ToUpper => {
                    let s = self.pop_str()?;
                    self.stack.push(Value::Str(Cow::Owned(s.to_uppercase())));
                }
                Op::Subst => {
                    let s = self.pop_str()?;
                    let new = self.pop_str()?;
                    let old = self.pop_str()?;
                    let replaced = if old.is_empty() { s.into_owned() } else { s.replace(old.as_ref(), &new) };
                    self.stack.push(Value::Str(Cow::Owned(replaced)));
                }
                Op::SubstRegex(regex) => {
                    let s = self.pop_str()?;
                    let new = self.pop_str()?;
                    let re = &program
                        .regexes
                        .get(usize::from(regex))
                        .ok_or(Fault::BadOperand(regex))?
                        .regex;
                    let replaced = re.replace_all(&s, new.as_ref()).into_owned();
                    self.stack.push(Value::Str(Cow::Owned(replaced)));
                }
                Op::GetFilename => {
                    self.stack.push(Value::Str(Cow::Borrowed(self.line.filename)));
                }

                // Control flow
                Op::SetFlag(flag) => {
                    *self.flags.get_mut(usize::from(flag)).ok_or(Fault::BadOperand(flag))? = true;
                }
                Op::PushFlag(flag) => {
                    let set = *self.flags.get(usize::from(flag)).ok_or(Fault::BadOperand(flag))?;
                    self.stack.push(Value::Bool(set));
                }
                Op::Jump(target) => next = usize::from(target),
                Op::JumpIfFalse(target) => {
                    if !self.pop_bool()? {
                        next = usize::from(target);
                    }
                }
                Op::JumpIfFalseOrPop(target) => {
                    if self.peek_bool()? {
                        self.pop()?;
                    } else {
                        next = usize::from(target);
                    }
                }
                Op::JumpIfTrueOrPop(target) => {
                    if self.peek_bool()? {
                        next = usize::from(target);
                    } else {
                        self.pop()?;
                    }
                }
                Op::Halt => return Ok(()),
            }

            *ip = next;
        }
        Ok(())
    }

    /// Match and, if the program reads this regex's captures, record them.
    fn match_regex(&mut self, regex: u16, subject: Cow<'a, str>) -> Result<bool, Fault> {
        let compiled = self
            .program
            .regexes
            .get(usize::from(regex))
            .ok_or(Fault::BadOperand(regex))?;
        if !compiled.capture {
            return Ok(compiled.regex.is_match(&subject));
        }
        let groups: Option<Vec<Cow<'a, str>>> = match subject {
            Cow::Borrowed(s) => compiled.regex.captures(s).map(|caps| {
                caps.iter()
                    .map(|m| Cow::Borrowed(m.map_or("", |m| m.as_str())))
                    .collect()
            }),
            Cow::Owned(s) => compiled.regex.captures(&s).map(|caps| {
                caps.iter()
                    .map(|m| Cow::Owned(m.map_or("", |m| m.as_str()).to_string()))
                    .collect()
            }),
        };
        let Some(groups) = groups else {
            return Ok(false);
        };
        if let Some(slot) = self.captures.get_mut(usize::from(regex)) {
            *slot = Some(groups);
        }
        Ok(true)
    }

    fn metric(&self, id: u16) -> Result<&Arc<Metric>, Fault> {
        self.metrics.get(usize::from(id)).ok_or(Fault::UnboundMetric(id))
    }

    fn effective_time(&mut self) -> DateTime<Utc> {
        if let Some(at) = self.timestamp {
            return at;
        }
        *self.now.get_or_insert_with(Utc::now)
    }

    fn pop(&mut self) -> Result<Value<'a>, Fault> {
        self.stack.pop().ok_or(Fault::StackUnderflow)
    }

    fn pop_labels(&mut self, count: u8) -> Result<Vec<String>, Fault> {
        let start = self
            .stack
            .len()
            .checked_sub(usize::from(count))
            .ok_or(Fault::StackUnderflow)?;
        Ok(self.stack.drain(start..).map(Value::into_label).collect())
    }

    fn pop_int(&mut self) -> Result<i64, Fault> {
        match self.pop()? {
            Value::Int(v) => Ok(v),
            other => Err(mismatch("int", &other)),
        }
    }

    fn pop_float(&mut self) -> Result<f64, Fault> {
        match self.pop()? {
            Value::Float(v) => Ok(v),
            other => Err(mismatch("float", &other)),
        }
    }

    fn pop_number(&mut self) -> Result<Number, Fault> {
        match self.pop()? {
            Value::Int(v) => Ok(Number::Int(v)),
            Value::Float(v) => Ok(Number::Float(v)),
            other => Err(mismatch("number", &other)),
        }
    }

    fn pop_bool(&mut self) -> Result<bool, Fault> {
        match self.pop()? {
            Value::Bool(b) => Ok(b),
            other => Err(mismatch("bool", &other)),
        }
    }

    fn peek_bool(&self) -> Result<bool, Fault> {
        match self.stack.last() {
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(mismatch("bool", other)),
            None => Err(Fault::StackUnderflow),
        }
    }

    fn pop_str(&mut self) -> Result<Cow<'a, str>, Fault> {
        match self.pop()? {
            Value::Str(s) => Ok(s),
            other => Err(mismatch("string", &other)),
        }
    }

    fn int_binop(&mut self, f: impl FnOnce(i64, i64) -> Result<i64, Fault>) -> Result<(), Fault> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.stack.push(Value::Int(f(a, b)?));
        Ok(())
    }

    fn float_binop(&mut self, f: impl FnOnce(f64, f64) -> f64) -> Result<(), Fault> {
        let b = self.pop_float()?;
        let a = self.pop_float()?;
        self.stack.push(Value::Float(f(a, b)));
        Ok(())
    }
}

fn mismatch(expected: &'static str, found: &Value<'_>) -> Fault {
    Fault::TypeMismatch {
        expected,
        found: found.describe(),
    }
}

fn compare<T: PartialOrd + ?Sized>(cmp: CmpOp, a: &T, b: &T) -> bool {
    match cmp {
        CmpOp::Lt => a < b,
        CmpOp::Gt => a > b,
        CmpOp::Le => a <= b,
        CmpOp::Ge => a >= b,
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
    }
}

fn shift_amount(b: i64) -> u32 {
    u32::try_from(b & 63).unwrap_or(0)
}

fn parse_int(s: &str) -> Result<i64, Fault> {
    s.trim().parse().map_err(|_| Fault::Coercion {
        value: format!("{s:?}"),
        target: "int",
    })
}

fn parse_float(s: &str) -> Result<f64, Fault> {
    s.trim().parse().map_err(|_| Fault::Coercion {
        value: format!("{s:?}"),
        target: "float",
    })
}

/// Parse `value` with a strftime-style `format`. Formats with an offset give
/// that instant; formats without one are taken as UTC; date-only formats
/// give midnight.
fn parse_time(value: &str, format: &str) -> Result<DateTime<Utc>, Fault> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_str(value, format) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, format) {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(Fault::Time {
        value: value.to_string(),
        format: format.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::dsl::compile_source;
    use crate::metrics::{Datum, MetricStore};

    struct Harness {
        program: CompiledProgram,
        store: MetricStore,
        metrics: Vec<Arc<Metric>>,
    }

    impl Harness {
        fn new(src: &str) -> Self {
            let program = compile_source("test.lm", src).unwrap();
            let store = MetricStore::new();
            let metrics = program
                .metrics
                .iter()
                .map(|spec| store.declare(spec.clone()).unwrap())
                .collect();
            Self { program, store, metrics }
        }

        fn feed(&self, text: &str) -> Result<(), ExecutionError> {
            let line = LogLine { filename: "/var/log/app.log", text };
            execute(&self.program, &self.metrics, &line)
        }

        fn value(&self, name: &str, labels: &[&str]) -> Option<Datum> {
            let labels: Vec<String> = labels.iter().map(|s| (*s).to_string()).collect();
            self.store.get(name).unwrap().get(&labels)
        }
    }

    #[test]
    fn counts_matching_lines_by_capture() {
        let h = Harness::new("counter logins by user\n/^login (\\w+)$/ {\n logins[$1]++\n}");
        h.feed("login alice").unwrap();
        h.feed("login bob").unwrap();
        h.feed("login alice").unwrap();
        h.feed("logout alice").unwrap();
        assert_eq!(h.value("logins", &["alice"]), Some(Datum::Int(2)));
        assert_eq!(h.value("logins", &["bob"]), Some(Datum::Int(1)));
    }

    #[test]
    fn gauge_set_from_capture() {
        let h = Harness::new("gauge temp\n/temp=(\\d+)/ { temp = $1 }");
        h.feed("temp=21").unwrap();
        h.feed("temp=19").unwrap();
        assert_eq!(h.value("temp", &[]), Some(Datum::Int(19)));
    }

    #[test]
    fn histogram_observes() {
        let h = Harness::new("histogram lat buckets 1, 10\n/took (\\S+)s/ { lat = $1 }");
        h.feed("took 0.5s").unwrap();
        h.feed("took 5s").unwrap();
        h.feed("took 50s").unwrap();
        let Some(Datum::Buckets(b)) = h.value("lat", &[]) else { panic!("expected buckets") };
        assert_eq!(b.counts, vec![1, 1, 1]);
        assert_eq!(b.sum, 55.5);
    }

    #[test]
    fn otherwise_runs_when_nothing_matched() {
        let h = Harness::new("counter hit\ncounter miss\n/a/ { hit++ }\n/b/ { hit++ }\notherwise { miss++ }");
        h.feed("a").unwrap();
        h.feed("c").unwrap();
        h.feed("d").unwrap();
        assert_eq!(h.value("hit", &[]), Some(Datum::Int(1)));
        assert_eq!(h.value("miss", &[]), Some(Datum::Int(2)));
    }

    #[test]
    fn else_branch() {
        let h = Harness::new("counter a\ncounter b\n/x/ { a++ } else { b++ }");
        h.feed("x").unwrap();
        h.feed("y").unwrap();
        h.feed("y").unwrap();
        assert_eq!(h.value("a", &[]), Some(Datum::Int(1)));
        assert_eq!(h.value("b", &[]), Some(Datum::Int(2)));
    }

    #[test]
    fn stop_halts_the_line() {
        let h = Harness::new("counter a\ncounter b\n/x/ {\n a++\n stop\n}\n/x/ { b++ }");
        h.feed("x").unwrap();
        assert_eq!(h.value("a", &[]), Some(Datum::Int(1)));
        assert_eq!(h.value("b", &[]), None);
    }

    #[test]
    fn next_skips_rest_of_item_only() {
        let h = Harness::new("counter a\ncounter b\n/x/ {\n next\n a++\n}\n/x/ { b++ }");
        h.feed("x").unwrap();
        assert_eq!(h.value("a", &[]), None);
        assert_eq!(h.value("b", &[]), Some(Datum::Int(1)));
    }

    #[test]
    fn division_by_zero_is_located() {
        let h = Harness::new("gauge g\n/(\\d+) (\\d+)/ {\n g = int($1) / int($2)\n}");
        let err = h.feed("4 0").unwrap_err();
        assert_eq!(err.fault, Fault::DivisionByZero);
        assert_eq!(err.position.line, 3);
        assert_eq!(err.to_string(), format!("test.lm:{}: integer division by zero", err.position));
        h.feed("9 3").unwrap();
        assert_eq!(h.value("g", &[]), Some(Datum::Int(3)));
    }

    #[test]
    fn gauge_division_by_zero_keeps_value() {
        let h = Harness::new("gauge g\n/set (\\d+)/ { g = $1 }\n/div (\\d+)/ { g /= int($1) }");
        h.feed("set 10").unwrap();
        let err = h.feed("div 0").unwrap_err();
        assert!(matches!(err.fault, Fault::Update(UpdateError::DivisionByZero(_))));
        assert_eq!(h.value("g", &[]), Some(Datum::Int(10)));
    }

    #[test]
    fn capture_that_is_not_a_number_faults() {
        let h = Harness::new("counter c\n/n=(\\S+)/ { c += $1 }");
        let err = h.feed("n=abc").unwrap_err();
        assert!(matches!(err.fault, Fault::Coercion { target: "number", .. }));
    }

    #[test]
    fn strptime_sets_update_time() {
        let h = Harness::new(
            "counter c\n/^(\\S+ \\S+) hit/ {\n strptime($1, \"%Y-%m-%d %H:%M:%S\")\n c++\n}",
        );
        h.feed("2024-03-01 12:00:00 hit").unwrap();
        let snap = h.store.get("c").unwrap().snapshot();
        assert_eq!(snap.entries[0].timestamp.timestamp(), 1_709_294_400);
    }

    #[test]
    fn string_builtins() {
        let h = Harness::new(
            "counter c by method, file\n/(\\w+) / {\n c[toupper($1), getfilename()]++\n}",
        );
        h.feed("get /").unwrap();
        assert_eq!(h.value("c", &["GET", "/var/log/app.log"]), Some(Datum::Int(1)));
    }

    #[test]
    fn subst_by_regex_and_string() {
        let h = Harness::new(
            "counter c by path\n/^(\\S+)$/ {\n c[subst(\"-\", \"_\", subst(/\\d+/, \"N\", $1))]++\n}",
        );
        h.feed("/user-42/items").unwrap();
        assert_eq!(h.value("c", &["/user_N/items"]), Some(Datum::Int(1)));
    }

    #[test]
    fn reads_other_metric() {
        let h = Harness::new("counter total\ngauge double\n/x/ {\n total++\n double = total * 2\n}");
        h.feed("x").unwrap();
        h.feed("x").unwrap();
        assert_eq!(h.value("double", &[]), Some(Datum::Float(4.0)));
    }

    #[test]
    fn logical_operators() {
        let h = Harness::new("counter both\ncounter either\n/a/ && /b/ { both++ }\n/a/ || /b/ { either++ }");
        h.feed("ab").unwrap();
        h.feed("a").unwrap();
        h.feed("c").unwrap();
        assert_eq!(h.value("both", &[]), Some(Datum::Int(1)));
        assert_eq!(h.value("either", &[]), Some(Datum::Int(2)));
    }

    #[test]
    fn negated_pattern_keeps_outer_captures() {
        let h = Harness::new("counter c by v\n/x(\\d)/ and not /y(\\d)/ { c[$1]++ }");
        h.feed("x1").unwrap();
        h.feed("x2 y3").unwrap();
        h.feed("zzz").unwrap();
        assert_eq!(h.value("c", &["1"]), Some(Datum::Int(1)));
        assert_eq!(h.value("c", &["2"]), None);
    }

    #[test]
    fn match_on_capture() {
        let h = Harness::new(
            "counter c by code\n/status=(\\d+)/ {\n $1 =~ /^5/ {\n c[$1]++\n }\n}",
        );
        h.feed("status=503").unwrap();
        h.feed("status=200").unwrap();
        assert_eq!(h.value("c", &["503"]), Some(Datum::Int(1)));
        assert_eq!(h.store.get("c").unwrap().snapshot().entries.len(), 1);
    }

    #[test]
    fn strtol_and_bad_base() {
        let h = Harness::new("gauge g\n/v=(\\w+) b=(\\d+)/ { g = strtol($1, $2) }");
        h.feed("v=ff b=16").unwrap();
        assert_eq!(h.value("g", &[]), Some(Datum::Int(255)));
        let err = h.feed("v=ff b=1").unwrap_err();
        assert_eq!(err.fault, Fault::InvalidBase(1));
    }

    #[test]
    fn parse_time_variants() {
        assert_eq!(parse_time("2024-03-01", "%Y-%m-%d").unwrap().timestamp(), 1_709_251_200);
        assert_eq!(
            parse_time("2024-03-01T00:00:00+01:00", "%Y-%m-%dT%H:%M:%S%:z").unwrap().timestamp(),
            1_709_247_600
        );
        assert!(parse_time("nope", "%Y").is_err());
    }
}
