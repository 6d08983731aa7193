use std::collections::HashMap;

use regex::Regex;

use super::ast::*;
use super::builtins::{self, BuiltinFn, Param};
use super::compiler::MetricOp;
use super::error::CompileError;
use crate::metrics::{ArithOp, MetricSpec, ValueType, DEFAULT_BUCKETS};

/// Static type of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Int,
    Float,
    Str,
    Bool,
    /// Text of a regex capture group: a string that coerces to a number
    /// where a number is required.
    Capture,
    /// A regex known at compile time. Only valid as a condition, as the right
    /// side of `=~`, or as an operand of pattern concatenation.
    Pattern,
    /// Result of a builtin called only for its effect.
    Void,
}

impl Type {
    fn is_numeric(self) -> bool {
        matches!(self, Type::Int | Type::Float)
    }

    fn is_stringy(self) -> bool {
        matches!(self, Type::Str | Type::Capture)
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Type::Int => "int",
            Type::Float => "float",
            Type::Str => "string",
            Type::Bool => "bool",
            Type::Capture => "capture",
            Type::Pattern => "pattern",
            Type::Void => "nothing",
        })
    }
}

/// Result of type checking: every name resolved, every expression typed,
/// decorators inlined.
#[derive(Debug, Clone)]
pub struct TypedProgram {
    /// Metric declarations, indexed by the ids used in `Update`/`LoadMetric`.
    pub metrics: Vec<MetricSpec>,
    /// Regexes, indexed by the ids used in matches and captures.
    pub regexes: Vec<RegexInfo>,
    pub body: Vec<TypedStmt>,
}

#[derive(Debug, Clone)]
pub struct RegexInfo {
    pub regex: Regex,
    /// Whether any `$name`/`$N` refers to this regex.
    pub captures_used: bool,
}

#[derive(Debug, Clone)]
pub struct TypedStmt {
    pub kind: TypedStmtKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum TypedStmtKind {
    Cond {
        condition: TypedExpr,
        then_body: Vec<TypedStmt>,
        else_body: Option<Vec<TypedStmt>>,
    },
    Otherwise(Vec<TypedStmt>),
    /// A nested statement list with its own `otherwise` scope, produced by
    /// inlining a decorator.
    Block(Vec<TypedStmt>),
    Update {
        metric: u16,
        labels: Vec<TypedExpr>,
        op: MetricOp,
        value: Option<TypedExpr>,
    },
    /// Skip the rest of the current top-level item.
    Next,
    Stop,
    Expr(TypedExpr),
}

#[derive(Debug, Clone)]
pub struct TypedExpr {
    pub kind: TypedExprKind,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum TypedExprKind {
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),
    BoolLit(bool),
    /// Regex source text, only ever seen while checking.
    Pattern(String),
    /// Match a regex against the current line.
    MatchLine(u16),
    /// Match a regex against a string value.
    MatchValue {
        subject: Box<TypedExpr>,
        regex: u16,
        negate: bool,
    },
    Capture {
        regex: u16,
        group: u16,
    },
    LoadMetric {
        metric: u16,
        labels: Vec<TypedExpr>,
    },
    /// Operands have been unified: both int, both float, both string-like,
    /// or both bool.
    BinOp {
        op: BinOp,
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<TypedExpr>,
    },
    Call {
        builtin: &'static BuiltinFn,
        args: Vec<TypedExpr>,
    },
    /// `subst(/re/, new, s)`
    SubstRegex {
        regex: u16,
        args: Vec<TypedExpr>,
    },
    IntToFloat(Box<TypedExpr>),
    /// Parse a capture as an integer.
    ParseInt(Box<TypedExpr>),
    /// Parse a capture as a float.
    ParseFloat(Box<TypedExpr>),
    /// Parse a capture as an int, or a float if it is not one.
    ParseNumber(Box<TypedExpr>),
}

pub fn type_check(program: &Program) -> Result<TypedProgram, Vec<CompileError>> {
    let mut ctx = TypeContext::new();
    ctx.check(program)
}

/// Maximum decorator nesting depth, which also stops a decorator from using itself.
const MAX_INLINE_DEPTH: u16 = 16;

struct TypeContext<'a> {
    /// Metric name → id
    metric_ids: HashMap<&'a str, u16>,
    metrics: Vec<MetricSpec>,
    /// Whether any update writes a float into the metric
    metric_float: Vec<bool>,
    /// Named regex constants: name → regex source
    consts: HashMap<&'a str, String>,
    defs: HashMap<&'a str, &'a DecoratorDef>,
    regexes: Vec<RegexInfo>,
    /// Regexes whose captures are visible, innermost last
    scopes: Vec<u16>,
    /// Bodies of the decorated blocks being inlined, innermost last. A `next`
    /// inside a decorator is replaced by the top entry.
    slots: Vec<&'a [Stmt]>,
    /// Errors accumulated
    errors: Vec<CompileError>,
    inline_depth: u16,
}

impl<'a> TypeContext<'a> {
    fn new() -> Self {
        Self {
            metric_ids: HashMap::new(),
            metrics: Vec::new(),
            metric_float: Vec::new(),
            consts: HashMap::new(),
            defs: HashMap::new(),
            regexes: Vec::new(),
            scopes: Vec::new(),
            slots: Vec::new(),
            errors: Vec::new(),
            inline_depth: 0,
        }
    }

    fn check(&mut self, program: &'a Program) -> Result<TypedProgram, Vec<CompileError>> {
        for decl in &program.decls {
            if let Err(e) = self.declare(decl) {
                self.errors.push(e);
            }
        }

        for c in &program.consts {
            if self.consts.contains_key(c.name.as_str()) || self.metric_ids.contains_key(c.name.as_str()) {
                self.errors.push(CompileError::type_error(
                    format!("'{}' is already defined", c.name),
                    c.span,
                ));
                continue;
            }
            match self.check_expr(&c.value) {
                Ok(TypedExpr { kind: TypedExprKind::Pattern(text), .. }) => {
                    if let Err(e) = Regex::new(&text) {
                        self.errors.push(CompileError::type_error(
                            format!("Invalid regex in constant '{}': {e}", c.name),
                            c.value.span,
                        ));
                    }
                    self.consts.insert(c.name.as_str(), text);
                }
                Ok(other) => self.errors.push(CompileError::type_error(
                    format!("Constant '{}' must be a pattern, found {}", c.name, other.ty),
                    c.value.span,
                )),
                Err(e) => self.errors.push(e),
            }
        }

        for d in &program.defs {
            if self.defs.insert(d.name.as_str(), d).is_some() {
                self.errors.push(CompileError::type_error(
                    format!("Decorator '{}' is defined twice", d.name),
                    d.span,
                ));
            }
            if !contains_next(&d.body) {
                self.errors.push(CompileError::type_error(
                    format!("Decorator '{}' has no 'next' to mark where the decorated block goes", d.name),
                    d.span,
                ));
            }
        }

        let body = self.check_block(&program.body);

        if self.errors.is_empty() {
            let mut metrics = std::mem::take(&mut self.metrics);
            for (spec, is_float) in metrics.iter_mut().zip(&self.metric_float) {
                if *is_float {
                    spec.value_type = ValueType::Float;
                }
            }
            Ok(TypedProgram {
                metrics,
                regexes: std::mem::take(&mut self.regexes),
                body,
            })
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    fn declare(&mut self, decl: &'a MetricDecl) -> Result<(), CompileError> {
        if self.metric_ids.contains_key(decl.name.as_str()) {
            return Err(CompileError::type_error(
                format!("Metric '{}' is declared twice", decl.name),
                decl.span,
            ));
        }
        let id = u16::try_from(self.metrics.len()).map_err(|_| {
            CompileError::type_error("Too many metrics in one program (max 65535)", decl.span)
        })?;
        let mut spec = MetricSpec::new(decl.name.clone(), decl.kind, decl.labels.clone());
        spec.hidden = decl.hidden;
        spec.export_name.clone_from(&decl.export_name);
        if decl.kind == MetricKind::Histogram {
            spec.buckets = if decl.buckets.is_empty() {
                DEFAULT_BUCKETS.to_vec()
            } else {
                decl.buckets.clone()
            };
        }
        self.metric_ids.insert(decl.name.as_str(), id);
        self.metrics.push(spec);
        self.metric_float.push(decl.kind == MetricKind::Histogram);
        Ok(())
    }

    // ── Statements ────────────────────────────────────────────────

    /// Check a block, collecting errors per statement so one bad statement
    /// does not hide the next.
    fn check_block(&mut self, stmts: &'a [Stmt]) -> Vec<TypedStmt> {
        let mut typed = Vec::with_capacity(stmts.len());
        let mut seen_cond = false;
        for stmt in stmts {
            if let Stmt::Otherwise { span, .. } = stmt {
                if !seen_cond {
                    self.errors.push(CompileError::type_error(
                        "'otherwise' must follow a condition in the same block",
                        *span,
                    ));
                }
            }
            if matches!(stmt, Stmt::Cond { .. }) {
                seen_cond = true;
            }
            match self.check_stmt(stmt) {
                Ok(ts) => typed.push(ts),
                Err(e) => self.errors.push(e),
            }
        }
        typed
    }

    fn check_stmt(&mut self, stmt: &'a Stmt) -> Result<TypedStmt, CompileError> {
        let span = stmt.span();
        let kind = match stmt {
            Stmt::Cond { condition, then_body, else_body, .. } => {
                let mark = self.scopes.len();
                let condition = self.check_condition(condition);
                let then_body = self.check_block(then_body);
                self.scopes.truncate(mark);
                let else_body = else_body.as_ref().map(|b| self.check_block(b));
                TypedStmtKind::Cond {
                    condition: condition?,
                    then_body,
                    else_body,
                }
            }
            Stmt::Otherwise { body, .. } => TypedStmtKind::Otherwise(self.check_block(body)),
            Stmt::Decorated { name, body, .. } => {
                let def = *self.defs.get(name.as_str()).ok_or_else(|| {
                    CompileError::type_error(format!("Unknown decorator '@{name}'"), span)
                })?;
                if self.inline_depth >= MAX_INLINE_DEPTH {
                    return Err(CompileError::type_error(
                        format!(
                            "Decorator '@{name}' exceeds maximum nesting depth ({MAX_INLINE_DEPTH}); recursive decorators are not supported"
                        ),
                        span,
                    ));
                }
                self.inline_depth += 1;
                self.slots.push(body);
                let inlined = self.check_block(&def.body);
                self.slots.pop();
                self.inline_depth -= 1;
                TypedStmtKind::Block(inlined)
            }
            Stmt::Next(_) => {
                if let Some(body) = self.slots.pop() {
                    // The decorated block takes the place of `next`, with the
                    // decorator's captures in scope.
                    let block = self.check_block(body);
                    self.slots.push(body);
                    TypedStmtKind::Block(block)
                } else {
                    TypedStmtKind::Next
                }
            }
            Stmt::Stop(_) => TypedStmtKind::Stop,
            Stmt::Update { target, op, value, .. } => self.check_update(target, *op, value.as_ref(), span)?,
            Stmt::Expr(expr) => {
                let typed = self.check_expr(expr)?;
                if typed.ty == Type::Pattern {
                    return Err(CompileError::type_error(
                        "Pattern has no action block",
                        expr.span,
                    ));
                }
                TypedStmtKind::Expr(typed)
            }
        };
        Ok(TypedStmt { kind, span })
    }

    fn check_update(
        &mut self,
        target: &'a MetricRef,
        op: AssignOp,
        value: Option<&'a Expr>,
        span: Span,
    ) -> Result<TypedStmtKind, CompileError> {
        let id = *self.metric_ids.get(target.name.as_str()).ok_or_else(|| {
            CompileError::type_error(format!("Unknown metric '{}'", target.name), target.span)
        })?;
        let (kind, label_count) = self
            .metrics
            .get(usize::from(id))
            .map(|m| (m.kind, m.labels.len()))
            .ok_or_else(|| CompileError::internal("Metric id out of range", span))?;

        let metric_op = match (kind, op) {
            (MetricKind::Counter, AssignOp::Incr) => Some(MetricOp::Incr),
            (MetricKind::Counter | MetricKind::Gauge, AssignOp::Add) => Some(MetricOp::Add),
            (MetricKind::Gauge | MetricKind::Timer, AssignOp::Set) => Some(MetricOp::Set),
            (MetricKind::Gauge, AssignOp::Sub) => Some(MetricOp::Update(ArithOp::Sub)),
            (MetricKind::Gauge, AssignOp::Mul) => Some(MetricOp::Update(ArithOp::Mul)),
            (MetricKind::Gauge, AssignOp::Div) => Some(MetricOp::Update(ArithOp::Div)),
            (MetricKind::Gauge, AssignOp::Mod) => Some(MetricOp::Update(ArithOp::Mod)),
            (MetricKind::Histogram, AssignOp::Set) => Some(MetricOp::Observe),
            _ => None,
        };
        if metric_op.is_none() {
            let supported = match kind {
                MetricKind::Counter => "'++' and '+='",
                MetricKind::Gauge => "'=', '+=', '-=', '*=', '/=' and '%='",
                MetricKind::Timer => "'='",
                MetricKind::Histogram => "'=' (observe)",
            };
            // Keep going so errors in the labels and value are reported too.
            self.errors.push(CompileError::type_error(
                format!(
                    "Cannot apply '{}' to {kind} '{}'; a {kind} supports {supported}",
                    op.symbol(),
                    target.name
                ),
                span,
            ));
        }

        let labels = self.check_labels(&target.name, label_count, &target.labels, target.span)?;

        let value = match value {
            Some(expr) => {
                let typed = self.check_expr(expr)?;
                let typed = match typed.ty {
                    Type::Int | Type::Float => typed,
                    // Parsed as an int when it looks like one, otherwise as a
                    // float; the store converts to the metric's value type.
                    Type::Capture => TypedExpr {
                        span: typed.span,
                        ty: Type::Int,
                        kind: TypedExprKind::ParseNumber(Box::new(typed)),
                    },
                    other => {
                        return Err(CompileError::type_error(
                            format!("Cannot update metric '{}' with a {other} value", target.name),
                            expr.span,
                        ));
                    }
                };
                if typed.ty == Type::Float {
                    if let Some(f) = self.metric_float.get_mut(usize::from(id)) {
                        *f = true;
                    }
                }
                Some(typed)
            }
            None => None,
        };

        // Reported above; the placeholder is never compiled.
        let op = metric_op.unwrap_or(MetricOp::Incr);
        Ok(TypedStmtKind::Update { metric: id, labels, op, value })
    }

    fn check_labels(
        &mut self,
        metric: &str,
        expected: usize,
        labels: &'a [Expr],
        span: Span,
    ) -> Result<Vec<TypedExpr>, CompileError> {
        if labels.len() != expected {
            return Err(CompileError::type_error(
                format!("Metric '{metric}' has {expected} label(s), but {} given", labels.len()),
                span,
            ));
        }
        labels
            .iter()
            .map(|l| {
                let typed = self.check_expr(l)?;
                if matches!(typed.ty, Type::Pattern | Type::Void) {
                    return Err(CompileError::type_error(
                        format!("A {} cannot be used as a label value", typed.ty),
                        l.span,
                    ));
                }
                Ok(typed)
            })
            .collect()
    }

    // ── Expressions ───────────────────────────────────────────────

    /// Check an expression used as a condition. Patterns become line matches.
    fn check_condition(&mut self, expr: &'a Expr) -> Result<TypedExpr, CompileError> {
        let typed = self.check_expr(expr)?;
        self.to_bool(typed)
    }

    fn to_bool(&mut self, expr: TypedExpr) -> Result<TypedExpr, CompileError> {
        match expr.kind {
            TypedExprKind::Pattern(text) => {
                let id = self.register_regex(&text, expr.span)?;
                self.scopes.push(id);
                Ok(TypedExpr {
                    kind: TypedExprKind::MatchLine(id),
                    ty: Type::Bool,
                    span: expr.span,
                })
            }
            _ if expr.ty == Type::Bool => Ok(expr),
            _ => Err(CompileError::type_error(
                format!("Condition must be a pattern or bool, found {}", expr.ty),
                expr.span,
            )),
        }
    }

    fn register_regex(&mut self, pattern: &str, span: Span) -> Result<u16, CompileError> {
        let regex = Regex::new(pattern).map_err(|e| {
            CompileError::type_error(format!("Invalid regex /{pattern}/: {e}"), span)
        })?;
        let id = u16::try_from(self.regexes.len()).map_err(|_| {
            CompileError::type_error("Too many regexes in one program (max 65535)", span)
        })?;
        self.regexes.push(RegexInfo {
            regex,
            captures_used: false,
        });
        Ok(id)
    }

    fn check_expr(&mut self, expr: &'a Expr) -> Result<TypedExpr, CompileError> {
        let span = expr.span;
        let typed = |kind, ty| TypedExpr { kind, ty, span };
        match &expr.kind {
            ExprKind::IntLit(v) => Ok(typed(TypedExprKind::IntLit(*v), Type::Int)),
            ExprKind::FloatLit(v) => Ok(typed(TypedExprKind::FloatLit(*v), Type::Float)),
            ExprKind::StrLit(s) => Ok(typed(TypedExprKind::StrLit(s.clone()), Type::Str)),
            ExprKind::BoolLit(b) => Ok(typed(TypedExprKind::BoolLit(*b), Type::Bool)),
            ExprKind::Regex(r) => Ok(typed(TypedExprKind::Pattern(r.clone()), Type::Pattern)),
            ExprKind::Capture(name) => self.resolve_capture(name, span),
            ExprKind::Ident(name) => {
                if let Some(text) = self.consts.get(name.as_str()) {
                    return Ok(typed(TypedExprKind::Pattern(text.clone()), Type::Pattern));
                }
                self.load_metric(name, &[], span)
            }
            ExprKind::Index { name, labels } => self.load_metric(name, labels, span),
            ExprKind::BinOp { op, left, right } => self.check_binop(*op, left, right, span),
            ExprKind::UnaryOp { op, operand } => {
                let mark = self.scopes.len();
                let operand = self.check_expr(operand)?;
                match op {
                    UnaryOp::Not => {
                        let operand = self.to_bool(operand)?;
                        // A negated match binds nothing.
                        self.scopes.truncate(mark);
                        Ok(typed(
                            TypedExprKind::UnaryOp { op: *op, operand: Box::new(operand) },
                            Type::Bool,
                        ))
                    }
                    UnaryOp::Neg => {
                        let operand = match operand.ty {
                            Type::Int | Type::Float => operand,
                            Type::Capture => Self::coerce_numeric(operand, Type::Float),
                            other => {
                                return Err(CompileError::type_error(
                                    format!("Cannot negate a {other}"),
                                    span,
                                ));
                            }
                        };
                        let ty = operand.ty;
                        Ok(typed(TypedExprKind::UnaryOp { op: *op, operand: Box::new(operand) }, ty))
                    }
                    UnaryOp::BitNot => {
                        let operand = match operand.ty {
                            Type::Int => operand,
                            Type::Capture => Self::coerce_numeric(operand, Type::Int),
                            other => {
                                return Err(CompileError::type_error(
                                    format!("Bitwise '~' needs an int, found {other}"),
                                    span,
                                ));
                            }
                        };
                        Ok(typed(TypedExprKind::UnaryOp { op: *op, operand: Box::new(operand) }, Type::Int))
                    }
                }
            }
            ExprKind::Match { subject, pattern, negate } => {
                let subject = self.check_expr(subject)?;
                if !subject.ty.is_stringy() {
                    return Err(CompileError::type_error(
                        format!("Left side of a match must be a string, found {}", subject.ty),
                        subject.span,
                    ));
                }
                let pattern = self.check_expr(pattern)?;
                let TypedExprKind::Pattern(text) = &pattern.kind else {
                    return Err(CompileError::type_error(
                        format!("Right side of a match must be a pattern, found {}", pattern.ty),
                        pattern.span,
                    ));
                };
                let id = self.register_regex(text, pattern.span)?;
                if !negate {
                    self.scopes.push(id);
                }
                Ok(typed(
                    TypedExprKind::MatchValue { subject: Box::new(subject), regex: id, negate: *negate },
                    Type::Bool,
                ))
            }
            ExprKind::Call { name, args } => self.check_call(name, args, span),
        }
    }

    fn check_binop(
        &mut self,
        op: BinOp,
        left: &'a Expr,
        right: &'a Expr,
        span: Span,
    ) -> Result<TypedExpr, CompileError> {
        let mark = self.scopes.len();
        let left = self.check_expr(left)?;
        if matches!(op, BinOp::And | BinOp::Or) {
            // Convert the left side first so its captures are visible on the right.
            let left = self.to_bool(left)?;
            // The right side of `or` only runs when the left failed, and the
            // body may run with either side unmatched, so neither binds.
            if op == BinOp::Or {
                self.scopes.truncate(mark);
            }
            let right = self.check_condition(right)?;
            if op == BinOp::Or {
                self.scopes.truncate(mark);
            }
            return Ok(TypedExpr {
                kind: TypedExprKind::BinOp { op, left: Box::new(left), right: Box::new(right) },
                ty: Type::Bool,
                span,
            });
        }
        let right = self.check_expr(right)?;

        let mismatch = |l: Type, r: Type| {
            CompileError::type_error(
                format!("Cannot apply '{}' to {l} and {r}", op.symbol()),
                span,
            )
        };

        // Compile-time regex concatenation.
        if op == BinOp::Add {
            if let (TypedExprKind::Pattern(l), TypedExprKind::Pattern(r)) = (&left.kind, &right.kind) {
                return Ok(TypedExpr {
                    kind: TypedExprKind::Pattern(format!("{l}{r}")),
                    ty: Type::Pattern,
                    span,
                });
            }
        }

        let (left, right, ty) = match op {
            BinOp::Add if (left.ty == Type::Str && right.ty.is_stringy())
                || (left.ty.is_stringy() && right.ty == Type::Str) =>
            {
                (left, right, Type::Str)
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Pow => {
                let target = Self::unify_numeric(left.ty, right.ty)
                    .ok_or_else(|| mismatch(left.ty, right.ty))?;
                (Self::coerce_numeric(left, target), Self::coerce_numeric(right, target), target)
            }
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr => {
                let int_like = |t: Type| matches!(t, Type::Int | Type::Capture);
                if !int_like(left.ty) || !int_like(right.ty) {
                    return Err(mismatch(left.ty, right.ty));
                }
                (Self::coerce_numeric(left, Type::Int), Self::coerce_numeric(right, Type::Int), Type::Int)
            }
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
                if left.ty.is_numeric() || right.ty.is_numeric() {
                    let target = Self::unify_numeric(left.ty, right.ty)
                        .ok_or_else(|| mismatch(left.ty, right.ty))?;
                    (Self::coerce_numeric(left, target), Self::coerce_numeric(right, target), Type::Bool)
                } else if left.ty.is_stringy() && right.ty.is_stringy() {
                    (left, right, Type::Bool)
                } else if left.ty == Type::Bool
                    && right.ty == Type::Bool
                    && matches!(op, BinOp::Eq | BinOp::Ne)
                {
                    (left, right, Type::Bool)
                } else {
                    return Err(mismatch(left.ty, right.ty));
                }
            }
            BinOp::And | BinOp::Or => return Err(CompileError::internal("Logical op fell through", span)),
        };

        Ok(TypedExpr {
            kind: TypedExprKind::BinOp { op, left: Box::new(left), right: Box::new(right) },
            ty,
            span,
        })
    }

    /// The numeric type both operands are brought to, if any. A capture takes
    /// the other side's type, and float when both sides are captures.
    fn unify_numeric(left: Type, right: Type) -> Option<Type> {
        match (left, right) {
            (Type::Int | Type::Capture, Type::Int) | (Type::Int, Type::Capture) => Some(Type::Int),
            (Type::Int | Type::Float | Type::Capture, Type::Float)
            | (Type::Float, Type::Int | Type::Capture)
            | (Type::Capture, Type::Capture) => Some(Type::Float),
            _ => None,
        }
    }

    /// Wrap `expr` in the conversion node that brings it to `target`.
    /// Callers have already checked that the conversion exists.
    fn coerce_numeric(expr: TypedExpr, target: Type) -> TypedExpr {
        let span = expr.span;
        let kind = match (expr.ty, target) {
            (Type::Int, Type::Float) => TypedExprKind::IntToFloat(Box::new(expr)),
            (Type::Capture, Type::Int) => TypedExprKind::ParseInt(Box::new(expr)),
            (Type::Capture, Type::Float) => TypedExprKind::ParseFloat(Box::new(expr)),
            _ => return expr,
        };
        TypedExpr { kind, ty: target, span }
    }

    fn resolve_capture(&mut self, name: &str, span: Span) -> Result<TypedExpr, CompileError> {
        if self.scopes.is_empty() {
            return Err(CompileError::type_error(
                format!("Capture '${name}' used where no pattern is known to have matched"),
                span,
            ));
        }
        let index = name.parse::<usize>().ok();
        let found = self.scopes.iter().rev().find_map(|&id| {
            let info = self.regexes.get(usize::from(id))?;
            let group = match index {
                Some(n) if n < info.regex.captures_len() => n,
                Some(_) => return None,
                None => info
                    .regex
                    .capture_names()
                    .position(|n| n == Some(name))?,
            };
            Some((id, group))
        });
        let Some((regex, group)) = found else {
            let what = if index.is_some() { "out of range" } else { "not defined" };
            return Err(CompileError::type_error(
                format!("Capture group '${name}' is {what} in the enclosing patterns"),
                span,
            ));
        };
        let group = u16::try_from(group)
            .map_err(|_| CompileError::type_error("Too many capture groups", span))?;
        if let Some(info) = self.regexes.get_mut(usize::from(regex)) {
            info.captures_used = true;
        }
        Ok(TypedExpr {
            kind: TypedExprKind::Capture { regex, group },
            ty: Type::Capture,
            span,
        })
    }

    fn load_metric(&mut self, name: &str, labels: &'a [Expr], span: Span) -> Result<TypedExpr, CompileError> {
        let Some(&id) = self.metric_ids.get(name) else {
            return Err(CompileError::type_error(format!("Unknown identifier '{name}'"), span));
        };
        let (kind, label_count) = self
            .metrics
            .get(usize::from(id))
            .map(|m| (m.kind, m.labels.len()))
            .ok_or_else(|| CompileError::internal("Metric id out of range", span))?;
        if kind == MetricKind::Histogram {
            return Err(CompileError::type_error(
                format!("Histogram '{name}' cannot be read as a value"),
                span,
            ));
        }
        let labels = self.check_labels(name, label_count, labels, span)?;
        Ok(TypedExpr {
            kind: TypedExprKind::LoadMetric { metric: id, labels },
            ty: Type::Float,
            span,
        })
    }

    fn check_call(&mut self, name: &str, args: &'a [Expr], span: Span) -> Result<TypedExpr, CompileError> {
        let builtin = builtins::lookup_builtin(name).ok_or_else(|| {
            CompileError::type_error(format!("Unknown function '{name}'"), span)
        })?;
        if args.len() != builtin.params.len() {
            return Err(CompileError::type_error(
                format!(
                    "{name}() takes {} argument(s), but {} given",
                    builtin.params.len(),
                    args.len()
                ),
                span,
            ));
        }

        let mut typed_args = Vec::with_capacity(args.len());
        for (i, (arg, (param_name, param))) in args.iter().zip(builtin.params).enumerate() {
            let typed = self.check_expr(arg)?;
            // subst(/re/, new, s) replaces by regex.
            if i == 0 && builtin.name == "subst" {
                if let TypedExprKind::Pattern(text) = &typed.kind {
                    let regex = self.register_regex(text, typed.span)?;
                    let rest = args
                        .get(1..)
                        .unwrap_or_default()
                        .iter()
                        .map(|a| self.check_string_arg(a, name))
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(TypedExpr {
                        kind: TypedExprKind::SubstRegex { regex, args: rest },
                        ty: Type::Str,
                        span,
                    });
                }
            }
            let ok = match param {
                Param::Str => typed.ty.is_stringy(),
                Param::Int => matches!(typed.ty, Type::Int | Type::Capture),
                Param::Any => !matches!(typed.ty, Type::Pattern | Type::Void),
            };
            if !ok {
                return Err(CompileError::type_error(
                    format!("Argument '{param_name}' of {name}() cannot be a {}", typed.ty),
                    arg.span,
                ));
            }
            let typed = if *param == Param::Int {
                Self::coerce_numeric(typed, Type::Int)
            } else {
                typed
            };
            typed_args.push(typed);
        }

        Ok(TypedExpr {
            kind: TypedExprKind::Call { builtin, args: typed_args },
            ty: builtin.ret,
            span,
        })
    }

    fn check_string_arg(&mut self, arg: &'a Expr, func: &str) -> Result<TypedExpr, CompileError> {
        let typed = self.check_expr(arg)?;
        if typed.ty.is_stringy() {
            Ok(typed)
        } else {
            Err(CompileError::type_error(
                format!("{func}() expects a string, found {}", typed.ty),
                arg.span,
            ))
        }
    }
}

/// Whether a decorator body contains a `next` outside of nested decorated blocks' own bodies.
fn contains_next(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|s| match s {
        Stmt::Next(_) => true,
        Stmt::Cond { then_body, else_body, .. } => {
            contains_next(then_body) || else_body.as_deref().is_some_and(contains_next)
        }
        Stmt::Otherwise { body, .. } | Stmt::Decorated { body, .. } => contains_next(body),
        _ => false,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dsl::error::ErrorKind;
    use crate::dsl::lexer::lex;
    use crate::dsl::parser::parse;
    use crate::metrics::MetricKind;

    fn check(src: &str) -> TypedProgram {
        let (tokens, errors) = lex(src);
        assert!(errors.is_empty(), "lex errors: {errors:?}");
        let program = parse(tokens).unwrap();
        type_check(&program).unwrap()
    }

    fn check_err(src: &str) -> Vec<CompileError> {
        let (tokens, _) = lex(src);
        let program = parse(tokens).unwrap();
        type_check(&program).unwrap_err()
    }

    fn first_update(typed: &TypedProgram) -> (&[TypedExpr], MetricOp, Option<&TypedExpr>) {
        fn find(stmts: &[TypedStmt]) -> Option<&TypedStmt> {
            stmts.iter().find_map(|s| match &s.kind {
                TypedStmtKind::Update { .. } => Some(s),
                TypedStmtKind::Cond { then_body, .. } => find(then_body),
                TypedStmtKind::Block(b) | TypedStmtKind::Otherwise(b) => find(b),
                _ => None,
            })
        }
        match &find(&typed.body).unwrap().kind {
            TypedStmtKind::Update { labels, op, value, .. } => (labels, *op, value.as_ref()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn counter_increment_with_capture_label() {
        let typed = check("counter logins by user\n/^login (\\w+)$/ {\n logins[$1]++\n}");
        let (labels, op, value) = first_update(&typed);
        assert_eq!(op, MetricOp::Incr);
        assert!(value.is_none());
        assert!(matches!(labels[0].kind, TypedExprKind::Capture { regex: 0, group: 1 }));
        assert!(typed.regexes[0].captures_used);
        assert_eq!(typed.metrics[0].value_type, ValueType::Int);
    }

    #[test]
    fn string_plus_int_is_rejected() {
        let errors = check_err("counter c\n/x/ { c = \"x\" + 1 }");
        assert!(errors.iter().all(|e| e.kind == ErrorKind::Type));
        assert!(errors.iter().any(|e| e.message.contains("Cannot apply '+' to string and int")));
        // `=` on a counter is reported alongside.
        assert!(errors.iter().any(|e| e.message.contains("counter 'c'")));
    }

    #[test]
    fn counter_rejects_set_and_gauge_rejects_incr() {
        let errors = check_err("counter c\ngauge g\n/x/ {\n c = 1\n g++\n}");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn histogram_set_is_observe() {
        let typed = check("histogram h\n/(\\d+)ms/ { h = $1 }");
        let (_, op, value) = first_update(&typed);
        assert_eq!(op, MetricOp::Observe);
        assert!(matches!(value.unwrap().kind, TypedExprKind::ParseNumber(_)));
        assert_eq!(typed.metrics[0].buckets, DEFAULT_BUCKETS.to_vec());
    }

    #[test]
    fn capture_coerces_to_other_operand_type() {
        let typed = check("gauge g\n/(\\d+)/ { g = $1 * 2 }");
        let (_, _, value) = first_update(&typed);
        let TypedExprKind::BinOp { left, .. } = &value.unwrap().kind else { panic!() };
        assert!(matches!(left.kind, TypedExprKind::ParseInt(_)));
        assert_eq!(typed.metrics[0].value_type, ValueType::Int);
    }

    #[test]
    fn float_update_makes_metric_float() {
        let typed = check("gauge g\n/x/ { g = 1 + 0.5 }");
        let (_, _, value) = first_update(&typed);
        let TypedExprKind::BinOp { left, .. } = &value.unwrap().kind else { panic!() };
        assert!(matches!(left.kind, TypedExprKind::IntToFloat(_)));
        assert_eq!(typed.metrics[0].value_type, ValueType::Float);
    }

    #[test]
    fn named_captures_resolve_innermost_first() {
        let typed = check(
            "counter c by v\n/(?P<v>a)/ {\n /(?P<v>b)/ {\n c[$v]++\n }\n}",
        );
        let (labels, _, _) = first_update(&typed);
        assert!(matches!(labels[0].kind, TypedExprKind::Capture { regex: 1, group: 1 }));
    }

    #[test]
    fn outer_captures_visible_in_nested_blocks() {
        let typed = check("counter c by v\n/(?P<v>a)/ {\n /b/ {\n c[$v]++\n }\n}");
        let (labels, _, _) = first_update(&typed);
        assert!(matches!(labels[0].kind, TypedExprKind::Capture { regex: 0, group: 1 }));
    }

    #[test]
    fn unknown_capture_is_rejected() {
        let errors = check_err("counter c by v\n/(a)/ { c[$2]++ }");
        assert!(errors[0].message.contains("out of range"));
        let errors = check_err("counter c by v\n/(a)/ { c[$name]++ }");
        assert!(errors[0].message.contains("not defined"));
    }

    #[test]
    fn capture_outside_pattern_is_rejected() {
        let errors = check_err("counter c by v\nc[$1]++");
        assert!(errors[0].message.contains("no pattern is known to have matched"));
    }

    #[test]
    fn const_patterns_concatenate() {
        let typed = check("const A /foo /\nconst B A + /(\\d+)/\ncounter c\nB { c++ }");
        assert_eq!(typed.regexes[0].regex.as_str(), "foo (\\d+)");
    }

    #[test]
    fn invalid_regex_is_a_type_error() {
        let errors = check_err("counter c\n/(unclosed/ { c++ }");
        assert!(errors[0].message.contains("Invalid regex"));
    }

    #[test]
    fn decorator_inlines_body_with_captures() {
        let typed = check(
            "counter c by host\ndef syslog {\n /^(?P<host>\\S+) / {\n next\n }\n}\n@syslog {\n /x/ { c[$host]++ }\n}",
        );
        let (labels, _, _) = first_update(&typed);
        assert!(matches!(labels[0].kind, TypedExprKind::Capture { regex: 0, group: 1 }));
        assert!(matches!(typed.body[0].kind, TypedStmtKind::Block(_)));
    }

    #[test]
    fn decorator_without_next_is_rejected() {
        let errors = check_err("def d { /x/ { } }\n@d { }");
        assert!(errors.iter().any(|e| e.message.contains("has no 'next'")));
    }

    #[test]
    fn recursive_decorator_is_rejected() {
        let errors = check_err("def d {\n /x/ {\n @d { next }\n }\n}\n@d { }");
        assert!(errors.iter().any(|e| e.message.contains("nesting depth")));
    }

    #[test]
    fn otherwise_needs_preceding_condition() {
        let errors = check_err("otherwise { }");
        assert!(errors[0].message.contains("'otherwise'"));
    }

    #[test]
    fn label_count_must_match() {
        let errors = check_err("counter c by a, b\n/(x)/ { c[$1]++ }");
        assert!(errors[0].message.contains("2 label(s)"));
    }

    #[test]
    fn builtin_argument_types() {
        check("gauge g\n/(\\d+) (\\S+)/ {\n g = strptime($2, \"%Y\") + len($2) + strtol($1, 16)\n}");
        let errors = check_err("gauge g\n/x/ { g = len(3) }");
        assert!(errors[0].message.contains("Argument 's' of len()"));
        let errors = check_err("/x/ { nope() }");
        assert!(errors[0].message.contains("Unknown function"));
    }

    #[test]
    fn subst_accepts_regex() {
        let typed = check("counter c by k\n/(\\S+)/ { c[subst(/\\d+/, \"N\", $1)]++ }");
        let (labels, _, _) = first_update(&typed);
        assert!(matches!(labels[0].kind, TypedExprKind::SubstRegex { regex: 1, .. }));
    }

    #[test]
    fn metric_read_is_float() {
        let typed = check("counter a\ngauge g\n/x/ { g = a * 2 }");
        assert_eq!(typed.metrics[1].value_type, ValueType::Float);
        assert_eq!(typed.metrics[0].kind, MetricKind::Counter);
    }

    #[test]
    fn duplicate_metric_is_rejected() {
        let errors = check_err("counter a\ngauge a");
        assert!(errors[0].message.contains("declared twice"));
    }

    #[test]
    fn condition_must_be_bool() {
        let errors = check_err("1 + 2 { }");
        assert!(errors[0].message.contains("Condition must be"));
    }

    #[test]
    fn or_operands_bind_no_captures() {
        let errors = check_err("counter c by v\n/a(\\d)/ or /b(\\d)/ { c[$1]++ }");
        assert!(errors[0].message.contains("no pattern is known to have matched"));

        // The left side's groups are not visible on the right either.
        let errors = check_err("counter c\n/a(\\d)/ || $1 == \"x\" { c++ }");
        assert!(errors[0].message.contains("no pattern is known to have matched"));
    }

    #[test]
    fn or_leaves_outer_captures_visible() {
        let typed = check("counter c by v\n/(\\w+)/ {\n /a(\\d)/ or /b(\\d)/ {\n c[$1]++\n }\n}");
        let (labels, _, _) = first_update(&typed);
        assert!(matches!(labels[0].kind, TypedExprKind::Capture { regex: 0, group: 1 }));
    }

    #[test]
    fn negated_pattern_binds_no_captures() {
        let errors = check_err("counter c by v\nnot /a(\\d)/ { c[$1]++ }");
        assert!(errors[0].message.contains("no pattern is known to have matched"));

        let typed = check("counter c by v\n/x(\\d)/ and not /y(\\d)/ { c[$1]++ }");
        let (labels, _, _) = first_update(&typed);
        assert!(matches!(labels[0].kind, TypedExprKind::Capture { regex: 0, group: 1 }));
    }

    #[test]
    fn and_binds_both_sides() {
        let typed = check("counter c by v\n/a(\\d)/ and /b(\\w)(\\w)/ { c[$2]++ }");
        let (labels, _, _) = first_update(&typed);
        assert!(matches!(labels[0].kind, TypedExprKind::Capture { regex: 1, group: 2 }));
    }

    #[test]
    fn match_operator_binds_captures() {
        let typed = check("counter c by m\n/(\\S+)/ {\n $1 =~ /^(GET|POST)$/ {\n c[$1]++\n }\n}");
        let (labels, _, _) = first_update(&typed);
        assert!(matches!(labels[0].kind, TypedExprKind::Capture { regex: 1, group: 1 }));
    }
}
