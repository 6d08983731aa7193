//! AST node types for the logmill program language.

/// Source span for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// A complete program file.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub decls: Vec<MetricDecl>,
    pub consts: Vec<ConstDef>,
    pub defs: Vec<DecoratorDef>,
    /// Top-level pattern/action pairs, in source order.
    pub body: Vec<Stmt>,
}

pub use crate::metrics::MetricKind;

/// `hidden counter requests by method, code as "http_requests"`
#[derive(Debug, Clone)]
pub struct MetricDecl {
    pub name: String,
    pub kind: MetricKind,
    pub labels: Vec<String>,
    pub hidden: bool,
    pub export_name: Option<String>,
    pub buckets: Vec<f64>,
    pub span: Span,
}

/// `const PREFIX /^\w+ \d+ /`, or a concatenation of regexes and earlier constants.
#[derive(Debug, Clone)]
pub struct ConstDef {
    pub name: String,
    pub value: Expr,
    pub span: Span,
}

/// `def syslog { /.../ { next } }`
#[derive(Debug, Clone)]
pub struct DecoratorDef {
    pub name: String,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// Statements.
#[derive(Debug, Clone)]
pub enum Stmt {
    /// `cond { ... } else { ... }`: a pattern/action pair or a nested condition.
    Cond {
        condition: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
        span: Span,
    },
    /// `otherwise { ... }`
    Otherwise { body: Vec<Stmt>, span: Span },
    /// `@name { ... }`
    Decorated {
        name: String,
        body: Vec<Stmt>,
        span: Span,
    },
    /// Metric update: `m[$a]++`, `m = x`, `m += x`.
    Update {
        target: MetricRef,
        op: AssignOp,
        value: Option<Expr>,
        span: Span,
    },
    /// `next`
    Next(Span),
    /// `stop`
    Stop(Span),
    /// A bare expression, evaluated for its side effects.
    Expr(Expr),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Cond { span, .. }
            | Stmt::Otherwise { span, .. }
            | Stmt::Decorated { span, .. }
            | Stmt::Update { span, .. } => *span,
            Stmt::Next(span) | Stmt::Stop(span) => *span,
            Stmt::Expr(e) => e.span,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricRef {
    pub name: String,
    pub labels: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `++`
    Incr,
    /// `=`
    Set,
    /// `+=`
    Add,
    /// `-=`
    Sub,
    /// `*=`
    Mul,
    /// `/=`
    Div,
    /// `%=`
    Mod,
}

impl AssignOp {
    pub fn symbol(self) -> &'static str {
        match self {
            AssignOp::Incr => "++",
            AssignOp::Set => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
            AssignOp::Mul => "*=",
            AssignOp::Div => "/=",
            AssignOp::Mod => "%=",
        }
    }
}

/// Expressions.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),
    BoolLit(bool),
    /// `/regex/`
    Regex(String),
    /// `$name` or `$1`
    Capture(String),
    /// Bare identifier: a metric or a named regex constant.
    Ident(String),
    /// `metric[$a, $b]` used as a value.
    Index { name: String, labels: Vec<Expr> },
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// `subject =~ /re/` or `subject !~ /re/`
    Match {
        subject: Box<Expr>,
        pattern: Box<Expr>,
        negate: bool,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}
