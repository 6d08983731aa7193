use super::ast::Span;

/// A compilation error with source location.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
    pub span: Span,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lexer,
    Parser,
    Type,
    /// Code generation hit an invariant the type checker should have upheld.
    Internal,
}

impl ErrorKind {
    fn label(self) -> &'static str {
        match self {
            ErrorKind::Lexer => "lexer",
            ErrorKind::Parser => "syntax",
            ErrorKind::Type => "type",
            ErrorKind::Internal => "internal",
        }
    }
}

impl CompileError {
    pub fn lexer(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind: ErrorKind::Lexer,
        }
    }

    pub fn parser(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind: ErrorKind::Parser,
        }
    }

    pub fn type_error(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind: ErrorKind::Type,
        }
    }

    pub fn internal(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind: ErrorKind::Internal,
        }
    }

    /// Format the error as `file:line:col: [kind] message`.
    pub fn format_with_source(&self, file: &str, source: &str) -> String {
        let pos = Position::from_offset(source, self.span.start);
        format!("{file}:{pos}: [{}] {}", self.kind.label(), self.message)
    }
}

/// A 1-based line/column position in program source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct Position {
    pub line: u32,
    pub col: u32,
}

impl Position {
    pub fn from_offset(source: &str, offset: usize) -> Self {
        let mut line = 1u32;
        let mut col = 1u32;
        for (i, ch) in source.char_indices() {
            if i >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        Self { line, col }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Maps byte offsets to positions without rescanning the source for every lookup.
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { line_starts }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn position(&self, source: &str, offset: usize) -> Position {
        let line_idx = self.line_starts.partition_point(|&s| s <= offset).saturating_sub(1);
        let line_start = self.line_starts.get(line_idx).copied().unwrap_or(0);
        let col = source
            .get(line_start..offset.min(source.len()))
            .map_or(0, |s| s.chars().count());
        Position {
            line: line_idx as u32 + 1,
            col: col as u32 + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_one_based() {
        let src = "counter a\n/x/ {\n  a++\n}";
        assert_eq!(Position::from_offset(src, 0), Position { line: 1, col: 1 });
        assert_eq!(Position::from_offset(src, 12), Position { line: 2, col: 3 });
    }

    #[test]
    fn line_index_matches_linear_scan() {
        let src = "counter a\n/x/ {\n  a++\n}";
        let index = LineIndex::new(src);
        for offset in 0..src.len() {
            assert_eq!(index.position(src, offset), Position::from_offset(src, offset));
        }
    }

    #[test]
    fn format_includes_file_and_kind() {
        let err = CompileError::type_error("bad", Span::new(10, 11));
        let text = err.format_with_source("prog.lm", "counter a\n/x/ {}");
        assert_eq!(text, "prog.lm:2:1: [type] bad");
    }
}
