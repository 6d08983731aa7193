#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod ast;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod error;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod lexer;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod parser;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod builtins;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod typeck;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod compiler;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod vm;

pub use compiler::CompiledProgram;
pub use error::CompileError;
pub use vm::{execute, ExecutionError, LogLine};

/// Compile program source into a `CompiledProgram` ready for VM execution.
///
/// This is the primary public entry point for the DSL pipeline:
/// source → lex → parse → type check → compile → `CompiledProgram`
///
/// Lexer errors are reported together with whatever the parser finds in the
/// recovered token stream.
pub fn compile_source(name: &str, source: &str) -> Result<CompiledProgram, Vec<CompileError>> {
    let (tokens, mut errors) = lexer::lex(source);
    let ast = match parser::parse(tokens) {
        Ok(ast) if errors.is_empty() => ast,
        Ok(_) => return Err(errors),
        Err(parse_errors) => {
            errors.extend(parse_errors);
            return Err(errors);
        }
    };
    let typed = typeck::type_check(&ast)?;
    compiler::compile(&typed, name, source).map_err(|e| vec![e])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use error::ErrorKind;

    #[test]
    fn pipeline_reports_each_stage() {
        assert!(compile_source("ok.lm", "counter a\n/x/ { a++ }").is_ok());

        let errors = compile_source("lex.lm", "counter a\n/x/ { a++ } ?").unwrap_err();
        assert!(errors.iter().any(|e| e.kind == ErrorKind::Lexer));

        let errors = compile_source("parse.lm", "counter\n").unwrap_err();
        assert_eq!(errors[0].kind, ErrorKind::Parser);

        let errors = compile_source("type.lm", "counter c\n/x/ { c = \"x\" + 1 }").unwrap_err();
        assert!(errors.iter().all(|e| e.kind == ErrorKind::Type));
    }
}
