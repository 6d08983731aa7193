use super::ast::Span;
use super::error::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Float(f64),
    Str(String),
    /// Regex literal body with `\/` already unescaped.
    Regex(String),
    /// `$name` or `$1`, holding the text after the `$`.
    Capture(String),
    True,
    False,

    // Identifiers & keywords
    Ident(String),
    Counter,
    Gauge,
    Timer,
    Histogram,
    Hidden,
    By,
    As,
    Buckets,
    Const,
    Def,
    If,
    Else,
    Otherwise,
    Next,
    Stop,
    And,
    Or,
    Not,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    At,
    Semicolon,

    // Operators
    Plus,
    PlusPlus,  // ++
    PlusEq,    // +=
    Minus,
    MinusEq,   // -=
    Star,
    StarStar,  // **
    StarEq,    // *=
    Slash,
    SlashEq,   // /=
    Percent,
    PercentEq, // %=
    Lt,
    Gt,
    Le,        // <=
    Ge,        // >=
    Shl,       // <<
    Shr,       // >>
    Eq,        // =
    EqEq,      // ==
    Ne,        // !=
    Tilde,     // =~
    NotTilde,  // !~
    AndAnd,    // &&
    OrOr,      // ||
    Bang,      // !
    Ampersand, // &
    Pipe,      // |
    Caret,     // ^
    BitNot,    // ~

    // Special
    Newline,
    Eof,
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

/// Tokenize program source. Lexing never stops at the first bad character:
/// every error is collected and the returned token stream skips the
/// offending input, so the parser can still report its own errors.
pub fn lex(source: &str) -> (Vec<SpannedToken>, Vec<CompileError>) {
    let mut lexer = Lexer::new(source);
    lexer.tokenize();
    (lexer.tokens, lexer.errors)
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    tokens: Vec<SpannedToken>,
    errors: Vec<CompileError>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn tokenize(&mut self) {
        while self.pos < self.bytes.len() {
            self.skip_whitespace_and_comments();
            if self.pos >= self.bytes.len() {
                break;
            }

            let start = self.pos;
            let ch = self.bytes[self.pos];

            match ch {
                b'\n' | b'\r' => {
                    // Collapse multiple newlines
                    while self.pos < self.bytes.len()
                        && (self.bytes[self.pos] == b'\n' || self.bytes[self.pos] == b'\r')
                    {
                        self.pos += 1;
                        self.skip_whitespace_and_comments();
                    }
                    if let Some(last) = self.tokens.last() {
                        if !Self::continues_expression(&last.token) {
                            self.push(Token::Newline, start, start + 1);
                        }
                    }
                }
                b'(' => { self.pos += 1; self.push(Token::LParen, start, self.pos); }
                b')' => { self.pos += 1; self.push(Token::RParen, start, self.pos); }
                b'{' => { self.pos += 1; self.push(Token::LBrace, start, self.pos); }
                b'}' => { self.pos += 1; self.push(Token::RBrace, start, self.pos); }
                b'[' => { self.pos += 1; self.push(Token::LBracket, start, self.pos); }
                b']' => { self.pos += 1; self.push(Token::RBracket, start, self.pos); }
                b',' => { self.pos += 1; self.push(Token::Comma, start, self.pos); }
                b'@' => { self.pos += 1; self.push(Token::At, start, self.pos); }
                b';' => { self.pos += 1; self.push(Token::Semicolon, start, self.pos); }
                b'^' => { self.pos += 1; self.push(Token::Caret, start, self.pos); }
                b'~' => { self.pos += 1; self.push(Token::BitNot, start, self.pos); }
                b'+' => {
                    self.pos += 1;
                    let token = match self.peek() {
                        Some(b'+') => { self.pos += 1; Token::PlusPlus }
                        Some(b'=') => { self.pos += 1; Token::PlusEq }
                        _ => Token::Plus,
                    };
                    self.push(token, start, self.pos);
                }
                b'-' => {
                    self.pos += 1;
                    let token = if self.peek() == Some(b'=') {
                        self.pos += 1;
                        Token::MinusEq
                    } else {
                        Token::Minus
                    };
                    self.push(token, start, self.pos);
                }
                b'*' => {
                    self.pos += 1;
                    let token = match self.peek() {
                        Some(b'*') => { self.pos += 1; Token::StarStar }
                        Some(b'=') => { self.pos += 1; Token::StarEq }
                        _ => Token::Star,
                    };
                    self.push(token, start, self.pos);
                }
                b'%' => {
                    self.pos += 1;
                    let token = if self.peek() == Some(b'=') {
                        self.pos += 1;
                        Token::PercentEq
                    } else {
                        Token::Percent
                    };
                    self.push(token, start, self.pos);
                }
                b'/' => {
                    self.pos += 1;
                    if self.regex_allowed() {
                        self.lex_regex(start);
                    } else if self.peek() == Some(b'=') {
                        self.pos += 1;
                        self.push(Token::SlashEq, start, self.pos);
                    } else {
                        self.push(Token::Slash, start, self.pos);
                    }
                }
                b'|' => {
                    self.pos += 1;
                    if self.peek() == Some(b'|') {
                        self.pos += 1;
                        self.push(Token::OrOr, start, self.pos);
                    } else {
                        self.push(Token::Pipe, start, self.pos);
                    }
                }
                b'&' => {
                    self.pos += 1;
                    if self.peek() == Some(b'&') {
                        self.pos += 1;
                        self.push(Token::AndAnd, start, self.pos);
                    } else {
                        self.push(Token::Ampersand, start, self.pos);
                    }
                }
                b'<' => {
                    self.pos += 1;
                    let token = match self.peek() {
                        Some(b'=') => { self.pos += 1; Token::Le }
                        Some(b'<') => { self.pos += 1; Token::Shl }
                        _ => Token::Lt,
                    };
                    self.push(token, start, self.pos);
                }
                b'>' => {
                    self.pos += 1;
                    let token = match self.peek() {
                        Some(b'=') => { self.pos += 1; Token::Ge }
                        Some(b'>') => { self.pos += 1; Token::Shr }
                        _ => Token::Gt,
                    };
                    self.push(token, start, self.pos);
                }
                b'=' => {
                    self.pos += 1;
                    let token = match self.peek() {
                        Some(b'=') => { self.pos += 1; Token::EqEq }
                        Some(b'~') => { self.pos += 1; Token::Tilde }
                        _ => Token::Eq,
                    };
                    self.push(token, start, self.pos);
                }
                b'!' => {
                    self.pos += 1;
                    let token = match self.peek() {
                        Some(b'=') => { self.pos += 1; Token::Ne }
                        Some(b'~') => { self.pos += 1; Token::NotTilde }
                        _ => Token::Bang,
                    };
                    self.push(token, start, self.pos);
                }
                b'"' => {
                    self.pos += 1;
                    self.lex_string(start);
                }
                b'$' => {
                    self.pos += 1;
                    self.lex_capture(start);
                }
                b'0'..=b'9' => {
                    self.lex_number(start);
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    self.lex_ident(start);
                }
                _ => {
                    // Step over the whole UTF-8 character so the next slice stays on a boundary.
                    let width = self.source[start..].chars().next().map_or(1, char::len_utf8);
                    self.errors.push(CompileError::lexer(
                        format!("Unexpected character: '{}'", &self.source[start..start + width]),
                        Span::new(start, start + width),
                    ));
                    self.pos += width;
                }
            }
        }

        // Remove trailing newline
        if let Some(last) = self.tokens.last() {
            if matches!(last.token, Token::Newline) {
                self.tokens.pop();
            }
        }

        self.tokens.push(SpannedToken {
            token: Token::Eof,
            span: Span::new(self.pos, self.pos),
        });
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn push(&mut self, token: Token, start: usize, end: usize) {
        // A binary operator (or `else`, or an opening brace) at the start of a
        // line continues the previous line.
        if Self::continues_from_previous(&token) {
            if let Some(last) = self.tokens.last() {
                if matches!(last.token, Token::Newline) {
                    self.tokens.pop();
                }
            }
        }
        self.tokens.push(SpannedToken {
            token,
            span: Span::new(start, end),
        });
    }

    /// A `/` starts a regex literal unless the previous token ends an operand.
    /// `const NAME /re/` is the one place a regex directly follows an identifier.
    fn regex_allowed(&self) -> bool {
        let n = self.tokens.len();
        let Some(last) = self.tokens.last() else {
            return true;
        };
        if let Token::Ident(_) = last.token {
            return n >= 2
                && self.tokens.get(n - 2).is_some_and(|t| matches!(t.token, Token::Const));
        }
        !matches!(
            last.token,
            Token::Int(_)
                | Token::Float(_)
                | Token::Str(_)
                | Token::Capture(_)
                | Token::Regex(_)
                | Token::True
                | Token::False
                | Token::RParen
                | Token::RBracket
        )
    }

    /// Returns true if a newline after this token should be suppressed.
    fn continues_expression(token: &Token) -> bool {
        matches!(
            token,
            Token::Plus
                | Token::Minus
                | Token::Star
                | Token::StarStar
                | Token::Slash
                | Token::Percent
                | Token::Lt
                | Token::Gt
                | Token::Le
                | Token::Ge
                | Token::Shl
                | Token::Shr
                | Token::EqEq
                | Token::Ne
                | Token::Tilde
                | Token::NotTilde
                | Token::AndAnd
                | Token::OrOr
                | Token::And
                | Token::Or
                | Token::Not
                | Token::Bang
                | Token::Ampersand
                | Token::Pipe
                | Token::Caret
                | Token::Eq
                | Token::PlusEq
                | Token::MinusEq
                | Token::StarEq
                | Token::SlashEq
                | Token::PercentEq
                | Token::Comma
                | Token::By
                | Token::Buckets
                | Token::LParen
                | Token::LBrace
                | Token::LBracket
                | Token::Semicolon
                | Token::Newline
        )
    }

    /// Tokens that, at the start of a line, continue the previous line.
    /// `-` and `!` are excluded because they also start a new statement.
    fn continues_from_previous(token: &Token) -> bool {
        matches!(
            token,
            Token::Plus
                | Token::Star
                | Token::StarStar
                | Token::Slash
                | Token::Percent
                | Token::Lt
                | Token::Gt
                | Token::Le
                | Token::Ge
                | Token::EqEq
                | Token::Ne
                | Token::Tilde
                | Token::NotTilde
                | Token::AndAnd
                | Token::OrOr
                | Token::And
                | Token::Or
                | Token::Pipe
                | Token::Caret
                | Token::Ampersand
                | Token::Else
                | Token::LBrace
        )
    }

    fn skip_whitespace_and_comments(&mut self) {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b' ' | b'\t' => self.pos += 1,
                b'#' => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_regex(&mut self, start: usize) {
        let mut pattern = String::new();
        let mut seg_start = self.pos;
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    pattern.push_str(&self.source[seg_start..self.pos]);
                    self.errors.push(CompileError::lexer(
                        "Unterminated regex literal",
                        Span::new(start, self.pos),
                    ));
                    break;
                }
                Some(b'\\') if self.bytes.get(self.pos + 1) == Some(&b'/') => {
                    pattern.push_str(&self.source[seg_start..self.pos]);
                    pattern.push('/');
                    self.pos += 2;
                    seg_start = self.pos;
                }
                Some(b'\\') => {
                    // Keep the escape verbatim for the regex engine.
                    self.pos += 1;
                    if self.peek().is_some_and(|b| b != b'\n') {
                        self.pos += self.source[self.pos..].chars().next().map_or(1, char::len_utf8);
                    }
                }
                Some(b'/') => {
                    pattern.push_str(&self.source[seg_start..self.pos]);
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    self.pos += self.source[self.pos..].chars().next().map_or(1, char::len_utf8);
                }
            }
        }
        self.push(Token::Regex(pattern), start, self.pos);
    }

    fn lex_string(&mut self, start: usize) {
        let mut value = String::new();
        let mut terminated = false;
        while let Some(ch) = self.source[self.pos..].chars().next() {
            match ch {
                '"' => {
                    self.pos += 1;
                    terminated = true;
                    break;
                }
                '\n' => break,
                '\\' => {
                    let esc_start = self.pos;
                    self.pos += 1;
                    let Some(next) = self.source[self.pos..].chars().next() else {
                        break;
                    };
                    self.pos += next.len_utf8();
                    match next {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '\\' => value.push('\\'),
                        '"' => value.push('"'),
                        other => {
                            self.errors.push(CompileError::lexer(
                                format!("Unknown escape sequence: '\\{other}'"),
                                Span::new(esc_start, self.pos),
                            ));
                            value.push(other);
                        }
                    }
                }
                other => {
                    value.push(other);
                    self.pos += other.len_utf8();
                }
            }
        }
        if !terminated {
            self.errors.push(CompileError::lexer(
                "Unterminated string literal",
                Span::new(start, self.pos),
            ));
        }
        self.push(Token::Str(value), start, self.pos);
    }

    fn lex_capture(&mut self, start: usize) {
        let name_start = self.pos;
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        if self.pos == name_start {
            self.errors.push(CompileError::lexer(
                "Expected capture group name or index after '$'",
                Span::new(start, self.pos),
            ));
            return;
        }
        let name = self.source[name_start..self.pos].to_string();
        self.push(Token::Capture(name), start, self.pos);
    }

    fn lex_number(&mut self, start: usize) {
        let mut is_float = false;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') && self.bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit) {
            is_float = true;
            self.pos += 1;
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let mut look = self.pos + 1;
            if matches!(self.bytes.get(look), Some(b'+' | b'-')) {
                look += 1;
            }
            if self.bytes.get(look).is_some_and(u8::is_ascii_digit) {
                is_float = true;
                self.pos = look;
                while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
            }
        }
        let text = &self.source[start..self.pos];
        if is_float {
            match text.parse::<f64>() {
                Ok(v) => self.push(Token::Float(v), start, self.pos),
                Err(_) => self.errors.push(CompileError::lexer(
                    format!("Invalid float: {text}"),
                    Span::new(start, self.pos),
                )),
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) => self.push(Token::Int(v), start, self.pos),
                Err(_) => self.errors.push(CompileError::lexer(
                    format!("Integer literal out of range: {text}"),
                    Span::new(start, self.pos),
                )),
            }
        }
    }

    fn lex_ident(&mut self, start: usize) {
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        let word = &self.source[start..self.pos];
        let token = match word {
            "counter" => Token::Counter,
            "gauge" => Token::Gauge,
            "timer" => Token::Timer,
            "histogram" => Token::Histogram,
            "hidden" => Token::Hidden,
            "by" => Token::By,
            "as" => Token::As,
            "buckets" => Token::Buckets,
            "const" => Token::Const,
            "def" => Token::Def,
            "if" => Token::If,
            "else" => Token::Else,
            "otherwise" => Token::Otherwise,
            "next" => Token::Next,
            "stop" => Token::Stop,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Ident(word.to_string()),
        };
        self.push(token, start, self.pos);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tok(s: &str) -> Vec<Token> {
        let (tokens, errors) = lex(s);
        assert!(errors.is_empty(), "unexpected lex errors: {errors:?}");
        tokens.into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn simple_tokens() {
        let tokens = tok("1 + 2.5");
        assert_eq!(tokens, vec![Token::Int(1), Token::Plus, Token::Float(2.5), Token::Eof]);
    }

    #[test]
    fn declaration_keywords() {
        let tokens = tok("hidden counter requests by method, code as \"reqs\"");
        assert_eq!(tokens, vec![
            Token::Hidden, Token::Counter, Token::Ident("requests".into()), Token::By,
            Token::Ident("method".into()), Token::Comma, Token::Ident("code".into()),
            Token::As, Token::Str("reqs".into()), Token::Eof,
        ]);
    }

    #[test]
    fn regex_at_statement_start() {
        let tokens = tok("/^login (\\w+)$/ {");
        assert_eq!(tokens, vec![
            Token::Regex("^login (\\w+)$".into()), Token::LBrace, Token::Eof,
        ]);
    }

    #[test]
    fn escaped_slash_in_regex() {
        let tokens = tok(r"/GET \/index/");
        assert_eq!(tokens, vec![Token::Regex("GET /index".into()), Token::Eof]);
    }

    #[test]
    fn slash_after_operand_is_division() {
        let tokens = tok("$x / 2");
        assert_eq!(tokens, vec![
            Token::Capture("x".into()), Token::Slash, Token::Int(2), Token::Eof,
        ]);
    }

    #[test]
    fn regex_after_const_name() {
        let tokens = tok("const PREFIX /^\\d+ /");
        assert_eq!(tokens, vec![
            Token::Const, Token::Ident("PREFIX".into()), Token::Regex("^\\d+ ".into()), Token::Eof,
        ]);
    }

    #[test]
    fn regex_concatenation() {
        let tokens = tok("PREFIX + /foo/");
        assert_eq!(tokens, vec![
            Token::Ident("PREFIX".into()), Token::Plus, Token::Regex("foo".into()), Token::Eof,
        ]);
    }

    #[test]
    fn captures() {
        let tokens = tok("$user $1");
        assert_eq!(tokens, vec![
            Token::Capture("user".into()), Token::Capture("1".into()), Token::Eof,
        ]);
    }

    #[test]
    fn assignment_operators() {
        let tokens = tok("a++ b += 1 c -= 1 d *= 2 e /= 2 f %= 3 g = 1");
        assert!(tokens.contains(&Token::PlusPlus));
        assert!(tokens.contains(&Token::PlusEq));
        assert!(tokens.contains(&Token::MinusEq));
        assert!(tokens.contains(&Token::StarEq));
        assert!(tokens.contains(&Token::SlashEq));
        assert!(tokens.contains(&Token::PercentEq));
        assert!(tokens.contains(&Token::Eq));
    }

    #[test]
    fn comparison_and_match_operators() {
        let tokens = tok("< <= > >= == != =~ !~ << >>");
        assert_eq!(tokens, vec![
            Token::Lt, Token::Le, Token::Gt, Token::Ge, Token::EqEq, Token::Ne,
            Token::Tilde, Token::NotTilde, Token::Shl, Token::Shr, Token::Eof,
        ]);
    }

    #[test]
    fn string_escapes() {
        let tokens = tok(r#""a\tb\"c\\""#);
        assert_eq!(tokens, vec![Token::Str("a\tb\"c\\".into()), Token::Eof]);
    }

    #[test]
    fn numeric_forms() {
        let tokens = tok("42 0.5 1e3 2.5e-1");
        assert_eq!(tokens, vec![
            Token::Int(42), Token::Float(0.5), Token::Float(1000.0), Token::Float(0.25), Token::Eof,
        ]);
    }

    #[test]
    fn comments_stripped() {
        let tokens = tok("a++ # bump\nb++");
        assert_eq!(tokens, vec![
            Token::Ident("a".into()), Token::PlusPlus, Token::Newline,
            Token::Ident("b".into()), Token::PlusPlus, Token::Eof,
        ]);
    }

    #[test]
    fn else_on_next_line_joins_block() {
        let tokens = tok("}\nelse {");
        assert_eq!(tokens, vec![Token::RBrace, Token::Else, Token::LBrace, Token::Eof]);
    }

    #[test]
    fn no_newline_after_lbrace() {
        let tokens = tok("{\nx++\n}");
        assert_eq!(tokens, vec![
            Token::LBrace, Token::Ident("x".into()), Token::PlusPlus,
            Token::Newline, Token::RBrace, Token::Eof,
        ]);
    }

    #[test]
    fn leading_operator_continuation() {
        let tokens = tok("a\n&& b");
        assert_eq!(tokens, vec![
            Token::Ident("a".into()), Token::AndAnd, Token::Ident("b".into()), Token::Eof,
        ]);
    }

    #[test]
    fn unknown_characters_are_collected_not_fatal() {
        let (tokens, errors) = lex("a ` b ` c");
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind == crate::dsl::error::ErrorKind::Lexer));
        let kinds: Vec<Token> = tokens.into_iter().map(|t| t.token).collect();
        assert_eq!(kinds, vec![
            Token::Ident("a".into()), Token::Ident("b".into()), Token::Ident("c".into()), Token::Eof,
        ]);
    }

    #[test]
    fn unterminated_regex_reports_error() {
        let (_, errors) = lex("/abc\n");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("Unterminated regex"));
    }

    #[test]
    fn always_ends_with_eof() {
        let (tokens, _) = lex("");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].token, Token::Eof);
    }
}
