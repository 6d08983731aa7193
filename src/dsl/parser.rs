use super::ast::*;
use super::error::CompileError;
use super::lexer::{SpannedToken, Token};

/// Parse a token stream into a program.
///
/// Errors inside statements are collected and the parser resynchronises at
/// the next statement boundary. A malformed declaration (`counter`, `const`,
/// ...) stops parsing of the file outright.
pub fn parse(tokens: Vec<SpannedToken>) -> Result<Program, Vec<CompileError>> {
    let mut parser = Parser::new(tokens);
    parser.parse_program()
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    errors: Vec<CompileError>,
}

impl Parser {
    fn new(tokens: Vec<SpannedToken>) -> Self {
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
        }
    }

    fn parse_program(&mut self) -> Result<Program, Vec<CompileError>> {
        let mut program = Program::default();

        self.skip_terminators();

        while !self.at_eof() {
            match self.peek() {
                Token::Hidden | Token::Counter | Token::Gauge | Token::Timer | Token::Histogram => {
                    match self.parse_decl() {
                        Ok(d) => program.decls.push(d),
                        Err(e) => {
                            self.errors.push(e);
                            break;
                        }
                    }
                }
                Token::Const => {
                    match self.parse_const() {
                        Ok(c) => program.consts.push(c),
                        Err(e) => {
                            self.errors.push(e);
                            break;
                        }
                    }
                }
                Token::Def => {
                    match self.parse_def() {
                        Ok(d) => program.defs.push(d),
                        Err(e) => {
                            self.errors.push(e);
                            break;
                        }
                    }
                }
                _ => {
                    let before = self.pos;
                    match self.parse_stmt() {
                        Ok(s) => program.body.push(s),
                        Err(e) => {
                            self.errors.push(e);
                            self.recover_to_terminator();
                            // An unmatched `}` has no enclosing block to close.
                            if self.pos == before {
                                self.advance();
                            }
                        }
                    }
                }
            }
            self.skip_terminators();
        }

        if self.errors.is_empty() {
            Ok(program)
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map_or(&Token::Eof, |t| &t.token)
    }

    fn span(&self) -> Span {
        self.tokens.get(self.pos).map_or(
            Span::new(0, 0),
            |t| t.span,
        )
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span, CompileError> {
        if self.peek() == expected {
            let sp = self.span();
            self.advance();
            Ok(sp)
        } else {
            Err(CompileError::parser(
                format!("Expected {}, got {}", describe(expected), describe(self.peek())),
                self.span(),
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), CompileError> {
        if let Token::Ident(name) = self.peek().clone() {
            let sp = self.span();
            self.advance();
            Ok((name, sp))
        } else {
            Err(CompileError::parser(
                format!("Expected identifier, got {}", describe(self.peek())),
                self.span(),
            ))
        }
    }

    fn skip_terminators(&mut self) {
        while matches!(self.peek(), Token::Semicolon | Token::Newline) {
            self.advance();
        }
    }

    fn expect_terminator(&mut self) -> Result<(), CompileError> {
        match self.peek() {
            Token::Semicolon | Token::Newline => {
                self.advance();
                Ok(())
            }
            Token::Eof | Token::RBrace => Ok(()),
            other => Err(CompileError::parser(
                format!("Expected end of statement, got {}", describe(other)),
                self.span(),
            )),
        }
    }

    /// Skip to the next statement boundary at the current nesting depth.
    /// A closing brace of the enclosing block is left for the caller.
    fn recover_to_terminator(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                Token::Eof => return,
                Token::Newline | Token::Semicolon if depth == 0 => break,
                Token::RBrace if depth == 0 => return,
                Token::RBrace => depth -= 1,
                Token::LBrace => depth += 1,
                _ => {}
            }
            self.advance();
        }
        self.skip_terminators();
    }

    // ── Top-level items ───────────────────────────────────────────

    fn parse_decl(&mut self) -> Result<MetricDecl, CompileError> {
        let start = self.span();
        let hidden = if matches!(self.peek(), Token::Hidden) {
            self.advance();
            true
        } else {
            false
        };
        let kind = match self.peek() {
            Token::Counter => MetricKind::Counter,
            Token::Gauge => MetricKind::Gauge,
            Token::Timer => MetricKind::Timer,
            Token::Histogram => MetricKind::Histogram,
            other => {
                return Err(CompileError::parser(
                    format!("Expected metric kind, got {}", describe(other)),
                    self.span(),
                ));
            }
        };
        self.advance();
        let (name, mut end) = self.expect_ident()?;

        let mut labels = Vec::new();
        if matches!(self.peek(), Token::By) {
            self.advance();
            loop {
                let (label, sp) = self.expect_ident()?;
                if labels.contains(&label) {
                    return Err(CompileError::parser(
                        format!("Duplicate label '{label}' in declaration of '{name}'"),
                        sp,
                    ));
                }
                labels.push(label);
                end = sp;
                if !matches!(self.peek(), Token::Comma) {
                    break;
                }
                self.advance();
            }
        }

        let mut export_name = None;
        if matches!(self.peek(), Token::As) {
            self.advance();
            if let Token::Str(s) = self.peek().clone() {
                end = self.span();
                self.advance();
                export_name = Some(s);
            } else {
                return Err(CompileError::parser(
                    format!("Expected export name string after 'as', got {}", describe(self.peek())),
                    self.span(),
                ));
            }
        }

        let mut buckets = Vec::new();
        if matches!(self.peek(), Token::Buckets) {
            let buckets_span = self.span();
            if kind != MetricKind::Histogram {
                return Err(CompileError::parser(
                    format!("Only histograms take buckets, but '{name}' is a {kind}"),
                    buckets_span,
                ));
            }
            self.advance();
            loop {
                let (value, sp) = self.parse_number()?;
                if buckets.last().is_some_and(|&prev| value <= prev) {
                    return Err(CompileError::parser(
                        "Histogram buckets must be strictly increasing",
                        sp,
                    ));
                }
                buckets.push(value);
                end = sp;
                if !matches!(self.peek(), Token::Comma) {
                    break;
                }
                self.advance();
            }
        }

        self.expect_terminator()?;
        Ok(MetricDecl {
            name,
            kind,
            labels,
            hidden,
            export_name,
            buckets,
            span: start.merge(end),
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn parse_number(&mut self) -> Result<(f64, Span), CompileError> {
        let start = self.span();
        let negative = if matches!(self.peek(), Token::Minus) {
            self.advance();
            true
        } else {
            false
        };
        let value = match self.peek() {
            Token::Int(v) => *v as f64,
            Token::Float(v) => *v,
            other => {
                return Err(CompileError::parser(
                    format!("Expected number, got {}", describe(other)),
                    self.span(),
                ));
            }
        };
        let span = start.merge(self.span());
        self.advance();
        Ok((if negative { -value } else { value }, span))
    }

    fn parse_const(&mut self) -> Result<ConstDef, CompileError> {
        let start = self.expect(&Token::Const)?;
        let (name, _) = self.expect_ident()?;
        let value = self.parse_add()?;
        let span = start.merge(value.span);
        self.expect_terminator()?;
        Ok(ConstDef { name, value, span })
    }

    fn parse_def(&mut self) -> Result<DecoratorDef, CompileError> {
        let start = self.expect(&Token::Def)?;
        let (name, _) = self.expect_ident()?;
        let (body, end) = self.parse_braced_block()?;
        Ok(DecoratorDef {
            name,
            body,
            span: start.merge(end),
        })
    }

    // ── Statements ────────────────────────────────────────────────

    /// `{ stmt* }`, returning the statements and the span of the closing brace.
    fn parse_braced_block(&mut self) -> Result<(Vec<Stmt>, Span), CompileError> {
        self.expect(&Token::LBrace)?;
        let stmts = self.parse_block();
        let end = self.expect(&Token::RBrace)?;
        Ok((stmts, end))
    }

    fn parse_block(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        self.skip_terminators();
        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            match self.parse_stmt() {
                Ok(s) => stmts.push(s),
                Err(e) => {
                    self.errors.push(e);
                    self.recover_to_terminator();
                }
            }
            self.skip_terminators();
        }
        stmts
    }

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        match self.peek() {
            Token::Next => {
                let span = self.span();
                self.advance();
                self.expect_terminator()?;
                Ok(Stmt::Next(span))
            }
            Token::Stop => {
                let span = self.span();
                self.advance();
                self.expect_terminator()?;
                Ok(Stmt::Stop(span))
            }
            Token::Otherwise => {
                let start = self.span();
                self.advance();
                let (body, end) = self.parse_braced_block()?;
                Ok(Stmt::Otherwise {
                    body,
                    span: start.merge(end),
                })
            }
            Token::At => {
                let start = self.span();
                self.advance();
                let (name, _) = self.expect_ident()?;
                let (body, end) = self.parse_braced_block()?;
                Ok(Stmt::Decorated {
                    name,
                    body,
                    span: start.merge(end),
                })
            }
            Token::If => {
                let start = self.span();
                self.advance();
                let condition = self.parse_expr()?;
                self.parse_cond(condition, start)
            }
            Token::Hidden | Token::Counter | Token::Gauge | Token::Timer | Token::Histogram
            | Token::Const | Token::Def => Err(CompileError::parser(
                format!("{} is only allowed at the top level", describe(self.peek())),
                self.span(),
            )),
            _ => {
                let expr = self.parse_expr()?;
                match self.peek() {
                    Token::LBrace => {
                        let start = expr.span;
                        self.parse_cond(expr, start)
                    }
                    Token::PlusPlus => {
                        let end = self.span();
                        self.advance();
                        let target = metric_ref(expr)?;
                        let span = target.span.merge(end);
                        self.expect_terminator()?;
                        Ok(Stmt::Update { target, op: AssignOp::Incr, value: None, span })
                    }
                    Token::Eq | Token::PlusEq | Token::MinusEq | Token::StarEq
                    | Token::SlashEq | Token::PercentEq => {
                        let op = match self.peek() {
                            Token::PlusEq => AssignOp::Add,
                            Token::MinusEq => AssignOp::Sub,
                            Token::StarEq => AssignOp::Mul,
                            Token::SlashEq => AssignOp::Div,
                            Token::PercentEq => AssignOp::Mod,
                            _ => AssignOp::Set,
                        };
                        self.advance();
                        let target = metric_ref(expr)?;
                        let value = self.parse_expr()?;
                        let span = target.span.merge(value.span);
                        self.expect_terminator()?;
                        Ok(Stmt::Update { target, op, value: Some(value), span })
                    }
                    _ => {
                        self.expect_terminator()?;
                        Ok(Stmt::Expr(expr))
                    }
                }
            }
        }
    }

    /// The block (and optional `else`) following a condition.
    fn parse_cond(&mut self, condition: Expr, start: Span) -> Result<Stmt, CompileError> {
        let (then_body, mut end) = self.parse_braced_block()?;
        let else_body = if matches!(self.peek(), Token::Else) {
            self.advance();
            if matches!(self.peek(), Token::If) {
                // else if: parse as single-element block
                let nested = self.parse_stmt()?;
                end = nested.span();
                Some(vec![nested])
            } else {
                let (body, else_end) = self.parse_braced_block()?;
                end = else_end;
                Some(body)
            }
        } else {
            None
        };
        Ok(Stmt::Cond {
            condition,
            then_body,
            else_body,
            span: start.merge(end),
        })
    }

    // ── Expression parsing (precedence climbing) ──────────────────

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Token::Or | Token::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = binop(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Token::And | Token::AndAnd) {
            self.advance();
            let right = self.parse_not()?;
            left = binop(BinOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, CompileError> {
        if matches!(self.peek(), Token::Not | Token::Bang) {
            let start = self.span();
            self.advance();
            let operand = self.parse_not()?;
            let span = start.merge(operand.span);
            return Ok(Expr {
                kind: ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            });
        }
        self.parse_match()
    }

    fn parse_match(&mut self) -> Result<Expr, CompileError> {
        let subject = self.parse_bit_or()?;
        let negate = match self.peek() {
            Token::Tilde => false,
            Token::NotTilde => true,
            _ => return Ok(subject),
        };
        self.advance();
        let pattern = self.parse_bit_or()?;
        let span = subject.span.merge(pattern.span);
        Ok(Expr {
            kind: ExprKind::Match {
                subject: Box::new(subject),
                pattern: Box::new(pattern),
                negate,
            },
            span,
        })
    }

    fn parse_bit_or(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_bit_xor()?;
        while matches!(self.peek(), Token::Pipe) {
            self.advance();
            let right = self.parse_bit_xor()?;
            left = binop(BinOp::BitOr, left, right);
        }
        Ok(left)
    }

    fn parse_bit_xor(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_bit_and()?;
        while matches!(self.peek(), Token::Caret) {
            self.advance();
            let right = self.parse_bit_and()?;
            left = binop(BinOp::BitXor, left, right);
        }
        Ok(left)
    }

    fn parse_bit_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_equality()?;
        while matches!(self.peek(), Token::Ampersand) {
            self.advance();
            let right = self.parse_equality()?;
            left = binop(BinOp::BitAnd, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinOp::Eq,
                Token::Ne => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = binop(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_shift()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinOp::Lt,
                Token::Gt => BinOp::Gt,
                Token::Le => BinOp::Le,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_shift()?;
            left = binop(op, left, right);
        }
        Ok(left)
    }

    fn parse_shift(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_add()?;
        loop {
            let op = match self.peek() {
                Token::Shl => BinOp::Shl,
                Token::Shr => BinOp::Shr,
                _ => break,
            };
            self.advance();
            let right = self.parse_add()?;
            left = binop(op, left, right);
        }
        Ok(left)
    }

    fn parse_add(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_mul()?;
            left = binop(op, left, right);
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_power()?;
            left = binop(op, left, right);
        }
        Ok(left)
    }

    /// Power operator `**`: right-associative, higher precedence than mul.
    fn parse_power(&mut self) -> Result<Expr, CompileError> {
        let left = self.parse_unary()?;
        if matches!(self.peek(), Token::StarStar) {
            self.advance();
            // Right-associative: recurse into parse_power (not parse_unary)
            let right = self.parse_power()?;
            Ok(binop(BinOp::Pow, left, right))
        } else {
            Ok(left)
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::BitNot => UnaryOp::BitNot,
            _ => return self.parse_postfix(),
        };
        let start = self.span();
        self.advance();
        let operand = self.parse_unary()?;
        let span = start.merge(operand.span);
        Ok(Expr {
            kind: ExprKind::UnaryOp {
                op,
                operand: Box::new(operand),
            },
            span,
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.peek() {
                Token::LParen => {
                    let ExprKind::Ident(name) = &expr.kind else {
                        break;
                    };
                    let name = name.clone();
                    self.advance();
                    let (args, end) = self.parse_args(&Token::RParen)?;
                    expr = Expr {
                        kind: ExprKind::Call { name, args },
                        span: expr.span.merge(end),
                    };
                }
                Token::LBracket => {
                    let name = match &expr.kind {
                        ExprKind::Ident(name) | ExprKind::Index { name, .. } => name.clone(),
                        _ => break,
                    };
                    self.advance();
                    let (mut more, end) = self.parse_args(&Token::RBracket)?;
                    if more.is_empty() {
                        return Err(CompileError::parser("Empty label list", end));
                    }
                    let mut labels = match expr.kind {
                        ExprKind::Index { labels, .. } => labels,
                        _ => Vec::new(),
                    };
                    labels.append(&mut more);
                    expr = Expr {
                        kind: ExprKind::Index { name, labels },
                        span: expr.span.merge(end),
                    };
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    /// Comma-separated expressions up to `close`, returning the closing token's span.
    fn parse_args(&mut self, close: &Token) -> Result<(Vec<Expr>, Span), CompileError> {
        let mut args = Vec::new();
        if self.peek() != close {
            args.push(self.parse_expr()?);
            while matches!(self.peek(), Token::Comma) {
                self.advance();
                args.push(self.parse_expr()?);
            }
        }
        let end = self.expect(close)?;
        Ok((args, end))
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let span = self.span();
        let kind = match self.peek().clone() {
            Token::Int(v) => ExprKind::IntLit(v),
            Token::Float(v) => ExprKind::FloatLit(v),
            Token::Str(s) => ExprKind::StrLit(s),
            Token::Regex(r) => ExprKind::Regex(r),
            Token::Capture(c) => ExprKind::Capture(c),
            Token::True => ExprKind::BoolLit(true),
            Token::False => ExprKind::BoolLit(false),
            Token::Ident(name) => ExprKind::Ident(name),
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                return Ok(expr);
            }
            other => {
                return Err(CompileError::parser(
                    format!("Unexpected {}", describe(&other)),
                    span,
                ));
            }
        };
        self.advance();
        Ok(Expr { kind, span })
    }
}

fn binop(op: BinOp, left: Expr, right: Expr) -> Expr {
    let span = left.span.merge(right.span);
    Expr {
        kind: ExprKind::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    }
}

/// The left-hand side of an update must name a metric, optionally indexed.
fn metric_ref(expr: Expr) -> Result<MetricRef, CompileError> {
    match expr.kind {
        ExprKind::Ident(name) => Ok(MetricRef { name, labels: Vec::new(), span: expr.span }),
        ExprKind::Index { name, labels } => Ok(MetricRef { name, labels, span: expr.span }),
        _ => Err(CompileError::parser(
            "Left side of an assignment must be a metric",
            expr.span,
        )),
    }
}

/// Human-readable token description for error messages.
fn describe(token: &Token) -> String {
    let text = match token {
        Token::Int(v) => return format!("integer {v}"),
        Token::Float(v) => return format!("float {v}"),
        Token::Str(s) => return format!("string \"{s}\""),
        Token::Regex(r) => return format!("regex /{r}/"),
        Token::Capture(c) => return format!("capture ${c}"),
        Token::Ident(name) => return format!("identifier '{name}'"),
        Token::True => "'true'",
        Token::False => "'false'",
        Token::Counter => "'counter'",
        Token::Gauge => "'gauge'",
        Token::Timer => "'timer'",
        Token::Histogram => "'histogram'",
        Token::Hidden => "'hidden'",
        Token::By => "'by'",
        Token::As => "'as'",
        Token::Buckets => "'buckets'",
        Token::Const => "'const'",
        Token::Def => "'def'",
        Token::If => "'if'",
        Token::Else => "'else'",
        Token::Otherwise => "'otherwise'",
        Token::Next => "'next'",
        Token::Stop => "'stop'",
        Token::And => "'and'",
        Token::Or => "'or'",
        Token::Not => "'not'",
        Token::LParen => "'('",
        Token::RParen => "')'",
        Token::LBrace => "'{'",
        Token::RBrace => "'}'",
        Token::LBracket => "'['",
        Token::RBracket => "']'",
        Token::Comma => "','",
        Token::At => "'@'",
        Token::Semicolon => "';'",
        Token::Plus => "'+'",
        Token::PlusPlus => "'++'",
        Token::PlusEq => "'+='",
        Token::Minus => "'-'",
        Token::MinusEq => "'-='",
        Token::Star => "'*'",
        Token::StarStar => "'**'",
        Token::StarEq => "'*='",
        Token::Slash => "'/'",
        Token::SlashEq => "'/='",
        Token::Percent => "'%'",
        Token::PercentEq => "'%='",
        Token::Lt => "'<'",
        Token::Gt => "'>'",
        Token::Le => "'<='",
        Token::Ge => "'>='",
        Token::Shl => "'<<'",
        Token::Shr => "'>>'",
        Token::Eq => "'='",
        Token::EqEq => "'=='",
        Token::Ne => "'!='",
        Token::Tilde => "'=~'",
        Token::NotTilde => "'!~'",
        Token::AndAnd => "'&&'",
        Token::OrOr => "'||'",
        Token::Bang => "'!'",
        Token::Ampersand => "'&'",
        Token::Pipe => "'|'",
        Token::Caret => "'^'",
        Token::BitNot => "'~'",
        Token::Newline => "end of line",
        Token::Eof => "end of input",
    };
    text.to_string()
}
