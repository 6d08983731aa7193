use std::fmt::Write as _;

use regex::Regex;

use super::ast::{BinOp, Span, UnaryOp};
use super::error::{CompileError, LineIndex, Position};
use super::typeck::{Type, TypedExpr, TypedExprKind, TypedProgram, TypedStmt, TypedStmtKind};
use crate::metrics::{ArithOp, MetricSpec};

/// A compiled program ready for VM execution.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub name: String,
    pub ops: Vec<Op>,
    /// Source position of each op, for runtime error messages.
    pub positions: Vec<Position>,
    pub constants: Vec<Constant>,
    pub regexes: Vec<CompiledRegex>,
    /// Metrics the program declares, indexed by the ids in `LoadMetric`/`StoreMetric`.
    pub metrics: Vec<MetricSpec>,
    /// Number of `otherwise` flags needed per execution.
    pub flag_count: u16,
}

#[derive(Debug, Clone)]
pub struct CompiledRegex {
    pub regex: Regex,
    /// Whether the program reads captures of this regex. Matches whose
    /// captures are never read skip capture extraction.
    pub capture: bool,
}

/// Constant pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Str(String),
}

/// How `StoreMetric` changes the addressed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricOp {
    /// Add one; no value on the stack.
    Incr,
    Add,
    Set,
    /// Record a histogram observation.
    Observe,
    /// Read-modify-write on a gauge.
    Update(ArithOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

/// Bytecode operations for the stack-based VM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Push a constant from the constant pool.
    PushConst(u16),
    PushBool(bool),
    /// Pop top of stack.
    Pop,

    // Matching
    /// Match a regex against the current line, push bool.
    Match(u16),
    /// Pop a string, match a regex against it, push bool.
    MatchValue(u16),
    /// Push a capture group of the most recent successful match of `regex`.
    LoadCapture { regex: u16, group: u16 },

    // Metrics
    /// Pop `labels` label values, push the entry's value as a float.
    LoadMetric { metric: u16, labels: u8 },
    /// Pop the value (unless `Incr`) then `labels` label values, and update the entry.
    StoreMetric { metric: u16, labels: u8, op: MetricOp },

    // Integer arithmetic
    IAdd,
    ISub,
    IMul,
    IDiv,
    IMod,
    IPow,
    INeg,

    // Float arithmetic
    FAdd,
    FSub,
    FMul,
    FDiv,
    FMod,
    FPow,
    FNeg,

    // Bitwise
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    BitNot,

    /// Pop two strings, push their concatenation.
    Concat,

    // Comparison
    ICmp(CmpOp),
    FCmp(CmpOp),
    SCmp(CmpOp),
    BCmp(CmpOp),
    Not,

    // Type conversion
    /// Pop int → push float
    IntToFloat,
    /// Pop capture text → push int
    ParseInt,
    /// Pop capture text → push float
    ParseFloat,
    /// Pop capture text → push int, or float if it is not an integer
    ParseNumber,

    // Builtins
    ToInt,
    ToFloat,
    ToStr,
    Strptime,
    Timestamp,
    Settime,
    Strtol,
    Len,
    ToLower,
    ToUpper,
    Subst,
    /// `subst` with a regex as the first argument.
    SubstRegex(u16),
    GetFilename,

    // Control flow
    /// Record that a condition in the block owning this flag matched.
    SetFlag(u16),
    PushFlag(u16),
    /// Unconditional jump.
    Jump(u16),
    /// Pop bool; jump if false.
    JumpIfFalse(u16),
    /// Jump if top is false, leaving it; otherwise pop it.
    JumpIfFalseOrPop(u16),
    /// Jump if top is true, leaving it; otherwise pop it.
    JumpIfTrueOrPop(u16),
    /// Stop processing the current line.
    Halt,
}

impl CompiledProgram {
    /// Human-readable listing for `logmill compile --dump`.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; program {}", self.name);
        for (i, m) in self.metrics.iter().enumerate() {
            let _ = writeln!(out, "; metric {i}: {} {} {:?} ({})", m.kind, m.name, m.labels, m.value_type);
        }
        for (i, r) in self.regexes.iter().enumerate() {
            let _ = writeln!(out, "; regex {i}: /{}/", r.regex.as_str());
        }
        for (i, (op, pos)) in self.ops.iter().zip(&self.positions).enumerate() {
            let detail = match op {
                Op::PushConst(idx) => match self.constants.get(usize::from(*idx)) {
                    Some(Constant::Int(v)) => format!("  ; {v}"),
                    Some(Constant::Float(v)) => format!("  ; {v:?}"),
                    Some(Constant::Str(s)) => format!("  ; {s:?}"),
                    None => String::new(),
                },
                _ => String::new(),
            };
            let _ = writeln!(out, "{i:>4}  {pos:<7}  {op:?}{detail}");
        }
        out
    }
}

/// Lower a checked program to bytecode. `source` is only used to turn spans
/// into line/column positions.
pub fn compile(typed: &TypedProgram, name: &str, source: &str) -> Result<CompiledProgram, CompileError> {
    let mut compiler = Compiler::new();

    let flag = compiler.block_flag(&typed.body)?;
    for stmt in &typed.body {
        compiler.compile_in_block(stmt, flag)?;
        // `next` outside a decorator skips to the following top-level item.
        let pending = std::mem::take(&mut compiler.next_jumps);
        for idx in pending {
            compiler.patch_jump(idx)?;
        }
    }
    compiler.emit(Op::Halt, Span::new(source.len(), source.len()));

    let index = LineIndex::new(source);
    let positions = compiler
        .spans
        .iter()
        .map(|s| index.position(source, s.start))
        .collect();

    Ok(CompiledProgram {
        name: name.to_string(),
        ops: compiler.ops,
        positions,
        constants: compiler.constants,
        regexes: typed
            .regexes
            .iter()
            .map(|r| CompiledRegex {
                regex: r.regex.clone(),
                capture: r.captures_used,
            })
            .collect(),
        metrics: typed.metrics.clone(),
        flag_count: compiler.flag_count,
    })
}

struct Compiler {
    ops: Vec<Op>,
    spans: Vec<Span>,
    constants: Vec<Constant>,
    flag_count: u16,
    /// Jumps emitted for `next` in the current top-level item.
    next_jumps: Vec<usize>,
}

impl Compiler {
    fn new() -> Self {
        Self {
            ops: Vec::new(),
            spans: Vec::new(),
            constants: Vec::new(),
            flag_count: 0,
            next_jumps: Vec::new(),
        }
    }

    fn emit(&mut self, op: Op, span: Span) -> usize {
        self.ops.push(op);
        self.spans.push(span);
        self.ops.len() - 1
    }

    fn emit_const(&mut self, value: Constant, span: Span) -> Result<(), CompileError> {
        let idx = self.add_constant(value, span)?;
        self.emit(Op::PushConst(idx), span);
        Ok(())
    }

    fn add_constant(&mut self, value: Constant, span: Span) -> Result<u16, CompileError> {
        // Floats compare by bits so NaN and -0.0 get their own slots.
        let existing = self.constants.iter().position(|c| match (c, &value) {
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        });
        if let Some(i) = existing {
            return u16::try_from(i).map_err(|_| CompileError::internal("Constant index overflow", span));
        }
        let idx = u16::try_from(self.constants.len())
            .map_err(|_| CompileError::type_error("Too many constants (max 65535)", span))?;
        self.constants.push(value);
        Ok(idx)
    }

    fn patch_jump(&mut self, idx: usize) -> Result<(), CompileError> {
        let target = u16::try_from(self.ops.len()).map_err(|_| {
            CompileError::type_error("Program too large (max 65535 ops)", Span::new(0, 0))
        })?;
        match &mut self.ops[idx] {
            Op::JumpIfFalse(dest)
            | Op::Jump(dest)
            | Op::JumpIfFalseOrPop(dest)
            | Op::JumpIfTrueOrPop(dest) => *dest = target,
            _ => {}
        }
        Ok(())
    }

    /// A block holding an `otherwise` gets a flag that each matching
    /// condition in it sets.
    fn block_flag(&mut self, stmts: &[TypedStmt]) -> Result<Option<u16>, CompileError> {
        let Some(s) = stmts.iter().find(|s| matches!(s.kind, TypedStmtKind::Otherwise(_))) else {
            return Ok(None);
        };
        let flag = self.flag_count;
        self.flag_count = flag
            .checked_add(1)
            .ok_or_else(|| CompileError::type_error("Too many 'otherwise' blocks", s.span))?;
        Ok(Some(flag))
    }

    fn compile_block(&mut self, stmts: &[TypedStmt]) -> Result<(), CompileError> {
        let flag = self.block_flag(stmts)?;
        for stmt in stmts {
            self.compile_in_block(stmt, flag)?;
        }
        Ok(())
    }

    fn compile_in_block(&mut self, stmt: &TypedStmt, flag: Option<u16>) -> Result<(), CompileError> {
        let span = stmt.span;
        match &stmt.kind {
            TypedStmtKind::Cond { condition, then_body, else_body } => {
                self.compile_expr(condition)?;
                let skip_then = self.emit(Op::JumpIfFalse(0), span);
                if let Some(flag) = flag {
                    self.emit(Op::SetFlag(flag), span);
                }
                self.compile_block(then_body)?;
                if let Some(else_body) = else_body {
                    let skip_else = self.emit(Op::Jump(0), span);
                    self.patch_jump(skip_then)?;
                    self.compile_block(else_body)?;
                    self.patch_jump(skip_else)?;
                } else {
                    self.patch_jump(skip_then)?;
                }
            }
            TypedStmtKind::Otherwise(body) => {
                let flag = flag.ok_or_else(|| CompileError::internal("'otherwise' without a flag", span))?;
                self.emit(Op::PushFlag(flag), span);
                self.emit(Op::Not, span);
                let skip = self.emit(Op::JumpIfFalse(0), span);
                self.compile_block(body)?;
                self.patch_jump(skip)?;
            }
            TypedStmtKind::Block(body) => self.compile_block(body)?,
            TypedStmtKind::Update { metric, labels, op, value } => {
                for label in labels {
                    self.compile_expr(label)?;
                }
                if let Some(value) = value {
                    self.compile_expr(value)?;
                }
                let count = Self::label_count(labels.len(), span)?;
                self.emit(Op::StoreMetric { metric: *metric, labels: count, op: *op }, span);
            }
            TypedStmtKind::Next => {
                let idx = self.emit(Op::Jump(0), span);
                self.next_jumps.push(idx);
            }
            TypedStmtKind::Stop => {
                self.emit(Op::Halt, span);
            }
            TypedStmtKind::Expr(expr) => {
                self.compile_expr(expr)?;
                if expr.ty != Type::Void {
                    self.emit(Op::Pop, span);
                }
            }
        }
        Ok(())
    }

    fn label_count(n: usize, span: Span) -> Result<u8, CompileError> {
        u8::try_from(n).map_err(|_| CompileError::type_error("Too many labels (max 255)", span))
    }

    fn compile_expr(&mut self, expr: &TypedExpr) -> Result<(), CompileError> {
        let span = expr.span;
        match &expr.kind {
            TypedExprKind::IntLit(v) => self.emit_const(Constant::Int(*v), span)?,
            TypedExprKind::FloatLit(v) => self.emit_const(Constant::Float(*v), span)?,
            TypedExprKind::StrLit(s) => self.emit_const(Constant::Str(s.clone()), span)?,
            TypedExprKind::BoolLit(b) => {
                self.emit(Op::PushBool(*b), span);
            }
            TypedExprKind::Pattern(_) => {
                return Err(CompileError::internal("Unresolved pattern reached codegen", span));
            }
            TypedExprKind::MatchLine(regex) => {
                self.emit(Op::Match(*regex), span);
            }
            TypedExprKind::MatchValue { subject, regex, negate } => {
                self.compile_expr(subject)?;
                self.emit(Op::MatchValue(*regex), span);
                if *negate {
                    self.emit(Op::Not, span);
                }
            }
            TypedExprKind::Capture { regex, group } => {
                self.emit(Op::LoadCapture { regex: *regex, group: *group }, span);
            }
            TypedExprKind::LoadMetric { metric, labels } => {
                for label in labels {
                    self.compile_expr(label)?;
                }
                let count = Self::label_count(labels.len(), span)?;
                self.emit(Op::LoadMetric { metric: *metric, labels: count }, span);
            }
            TypedExprKind::BinOp { op: op @ (BinOp::And | BinOp::Or), left, right } => {
                self.compile_expr(left)?;
                let jump = if *op == BinOp::And {
                    Op::JumpIfFalseOrPop(0)
                } else {
                    Op::JumpIfTrueOrPop(0)
                };
                let short = self.emit(jump, span);
                self.compile_expr(right)?;
                self.patch_jump(short)?;
            }
            TypedExprKind::BinOp { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let op = Self::binop(*op, left.ty)
                    .ok_or_else(|| CompileError::internal(format!("No '{}' for {}", op.symbol(), left.ty), span))?;
                self.emit(op, span);
            }
            TypedExprKind::UnaryOp { op, operand } => {
                self.compile_expr(operand)?;
                let op = match (op, operand.ty) {
                    (UnaryOp::Neg, Type::Int) => Op::INeg,
                    (UnaryOp::Neg, _) => Op::FNeg,
                    (UnaryOp::Not, _) => Op::Not,
                    (UnaryOp::BitNot, _) => Op::BitNot,
                };
                self.emit(op, span);
            }
            TypedExprKind::Call { builtin, args } => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(builtin.op, span);
            }
            TypedExprKind::SubstRegex { regex, args } => {
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Op::SubstRegex(*regex), span);
            }
            TypedExprKind::IntToFloat(inner) => {
                self.compile_expr(inner)?;
                self.emit(Op::IntToFloat, span);
            }
            TypedExprKind::ParseInt(inner) => {
                self.compile_expr(inner)?;
                self.emit(Op::ParseInt, span);
            }
            TypedExprKind::ParseFloat(inner) => {
                self.compile_expr(inner)?;
                self.emit(Op::ParseFloat, span);
            }
            TypedExprKind::ParseNumber(inner) => {
                self.compile_expr(inner)?;
                self.emit(Op::ParseNumber, span);
            }
        }
        Ok(())
    }

    /// Opcode for a binary operator whose operands have been unified to `ty`.
    fn binop(op: BinOp, ty: Type) -> Option<Op> {
        let cmp = match op {
            BinOp::Lt => Some(CmpOp::Lt),
            BinOp::Gt => Some(CmpOp::Gt),
            BinOp::Le => Some(CmpOp::Le),
            BinOp::Ge => Some(CmpOp::Ge),
            BinOp::Eq => Some(CmpOp::Eq),
            BinOp::Ne => Some(CmpOp::Ne),
            _ => None,
        };
        if let Some(cmp) = cmp {
            return Some(match ty {
                Type::Int => Op::ICmp(cmp),
                Type::Float => Op::FCmp(cmp),
                Type::Str | Type::Capture => Op::SCmp(cmp),
                Type::Bool => Op::BCmp(cmp),
                Type::Pattern | Type::Void => return None,
            });
        }
        Some(match (op, ty) {
            (BinOp::Add, Type::Str | Type::Capture) => Op::Concat,
            (BinOp::Add, Type::Int) => Op::IAdd,
            (BinOp::Sub, Type::Int) => Op::ISub,
            (BinOp::Mul, Type::Int) => Op::IMul,
            (BinOp::Div, Type::Int) => Op::IDiv,
            (BinOp::Mod, Type::Int) => Op::IMod,
            (BinOp::Pow, Type::Int) => Op::IPow,
            (BinOp::Add, Type::Float) => Op::FAdd,
            (BinOp::Sub, Type::Float) => Op::FSub,
            (BinOp::Mul, Type::Float) => Op::FMul,
            (BinOp::Div, Type::Float) => Op::FDiv,
            (BinOp::Mod, Type::Float) => Op::FMod,
            (BinOp::Pow, Type::Float) => Op::FPow,
            (BinOp::BitAnd, Type::Int) => Op::BitAnd,
            (BinOp::BitOr, Type::Int) => Op::BitOr,
            (BinOp::BitXor, Type::Int) => Op::BitXor,
            (BinOp::Shl, Type::Int) => Op::Shl,
            (BinOp::Shr, Type::Int) => Op::Shr,
            _ => return None,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dsl::compile_source;

    fn compile_str(src: &str) -> CompiledProgram {
        compile_source("test.lm", src).unwrap()
    }

    #[test]
    fn pattern_action_bytecode() {
        let program = compile_str("counter lines\n/x/ {\n lines++\n}");
        assert_eq!(
            program.ops,
            vec![
                Op::Match(0),
                Op::JumpIfFalse(3),
                Op::StoreMetric { metric: 0, labels: 0, op: MetricOp::Incr },
                Op::Halt,
            ]
        );
        assert!(!program.regexes[0].capture);
        assert_eq!(program.positions[0].line, 2);
        assert_eq!(program.positions[2].line, 3);
    }

    #[test]
    fn constants_are_deduplicated() {
        let program = compile_str("gauge a\ngauge b\n/x/ {\n a = 5\n b = 5\n a = 2.5\n}");
        assert_eq!(program.constants, vec![Constant::Int(5), Constant::Float(2.5)]);
    }

    #[test]
    fn arithmetic_follows_operand_type() {
        let program = compile_str("gauge g\n/(\\d+)/ {\n g = $1 + 1\n g = 1.5 * 2\n}");
        assert!(program.ops.contains(&Op::ParseInt));
        assert!(program.ops.contains(&Op::IAdd));
        assert!(program.ops.contains(&Op::IntToFloat));
        assert!(program.ops.contains(&Op::FMul));
        assert!(program.regexes[0].capture);
    }

    #[test]
    fn otherwise_allocates_flag() {
        let program = compile_str("counter a\ncounter b\n/x/ { a++ }\notherwise { b++ }");
        assert_eq!(program.flag_count, 1);
        assert!(program.ops.contains(&Op::SetFlag(0)));
        assert!(program.ops.contains(&Op::PushFlag(0)));
    }

    #[test]
    fn and_short_circuits() {
        let program = compile_str("counter a\n/x/ && /y/ { a++ }");
        assert_eq!(program.ops[0], Op::Match(0));
        assert_eq!(program.ops[1], Op::JumpIfFalseOrPop(3));
        assert_eq!(program.ops[2], Op::Match(1));
    }

    #[test]
    fn void_expression_is_not_popped() {
        let program = compile_str("/(\\d+)/ {\n settime($1)\n}");
        assert!(!program.ops.contains(&Op::Pop));
        assert!(program.ops.contains(&Op::Settime));
    }

    #[test]
    fn next_jumps_to_following_item() {
        let program = compile_str("counter a\n/x/ {\n next\n}\n/y/ { a++ }");
        let target = program.ops.iter().find_map(|op| match op {
            Op::Jump(t) => Some(*t),
            _ => None,
        });
        // Lands on the second item's match.
        assert_eq!(target.map(usize::from).and_then(|t| program.ops.get(t).copied()), Some(Op::Match(1)));
    }

    #[test]
    fn disassembly_lists_ops() {
        let program = compile_str("counter a by k\n/(\\w+)/ { a[$1]++ }");
        let text = program.disassemble();
        assert!(text.contains("; metric 0: counter a"));
        assert!(text.contains("LoadCapture { regex: 0, group: 1 }"));
        assert!(text.contains("Halt"));
    }
}
