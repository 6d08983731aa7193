//! Loading program files and binding them to the metric store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::dsl::{self, CompiledProgram, ExecutionError, LogLine};
use crate::metrics::{DeclarationError, Metric, MetricStore};

/// File extension of program sources.
pub const PROGRAM_EXTENSION: &str = "lm";

/// A compiled program together with the store handles of its metrics.
#[derive(Debug, Clone)]
pub struct BoundProgram {
    program: Arc<CompiledProgram>,
    metrics: Arc<[Arc<Metric>]>,
}

impl BoundProgram {
    /// Declare every metric of `program` in `store`. Fails on the first
    /// declaration that conflicts with a metric already in the store.
    pub fn bind(program: CompiledProgram, store: &MetricStore) -> Result<Self, DeclarationError> {
        let metrics = program
            .metrics
            .iter()
            .map(|spec| store.declare(spec.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            program: Arc::new(program),
            metrics: metrics.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.program.name
    }

    pub fn program(&self) -> &CompiledProgram {
        &self.program
    }

    pub fn run(&self, line: &LogLine<'_>) -> Result<(), ExecutionError> {
        dsl::execute(&self.program, &self.metrics, line)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Rendered diagnostics, one per line as `file:line:col: [kind] message`.
    #[error("{}", .diagnostics.join("\n"))]
    Compile {
        path: PathBuf,
        diagnostics: Vec<String>,
    },
    #[error("{}: {source}", .path.display())]
    Declaration {
        path: PathBuf,
        #[source]
        source: DeclarationError,
    },
}

impl LoadError {
    pub fn path(&self) -> &Path {
        match self {
            LoadError::Io { path, .. }
            | LoadError::Compile { path, .. }
            | LoadError::Declaration { path, .. } => path,
        }
    }
}

/// Outcome of loading a directory: the programs that loaded, in load order,
/// and the files that were excluded.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub programs: Vec<BoundProgram>,
    pub failures: Vec<LoadError>,
}

/// Compile `source` and bind it. `path` names the program in diagnostics.
pub fn load_source(path: &Path, source: &str, store: &MetricStore) -> Result<BoundProgram, LoadError> {
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    let compiled = dsl::compile_source(&name, source).map_err(|errors| LoadError::Compile {
        path: path.to_path_buf(),
        diagnostics: errors
            .iter()
            .map(|e| e.format_with_source(&name, source))
            .collect(),
    })?;
    BoundProgram::bind(compiled, store).map_err(|source| LoadError::Declaration {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_file(path: &Path, store: &MetricStore) -> Result<BoundProgram, LoadError> {
    let source = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_source(path, &source, store)
}

/// Program files under `dir`, sorted by file name. This is the load order.
pub fn program_files(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == PROGRAM_EXTENSION))
        .collect();
    files.sort();
    Ok(files)
}

/// Load every program in `dir`. A file that fails to read, compile or bind is
/// logged and excluded; the others still load. Only an unreadable directory
/// is an error.
pub fn load_dir(dir: &Path, store: &MetricStore) -> Result<LoadReport, LoadError> {
    let mut report = LoadReport::default();
    for path in program_files(dir)? {
        match load_file(&path, store) {
            Ok(program) => {
                tracing::debug!(
                    program = program.name(),
                    ops = program.program().ops.len(),
                    metrics = program.program().metrics.len(),
                    "loaded program"
                );
                report.programs.push(program);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "excluding program:\n{e}");
                report.failures.push(e);
            }
        }
    }
    tracing::info!(
        dir = %dir.display(),
        loaded = report.programs.len(),
        failed = report.failures.len(),
        "programs loaded"
    );
    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metrics::Datum;

    #[test]
    fn failing_program_is_excluded_others_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.lm"), "counter a\n/x/ { a++ }\n").unwrap();
        std::fs::write(dir.path().join("b.lm"), "counter b\n/x/ { b = \"x\" + 1 }\n").unwrap();
        std::fs::write(dir.path().join("c.lm"), "gauge c\n/x/ { c = 1 }\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a program").unwrap();

        let store = MetricStore::new();
        let report = load_dir(dir.path(), &store).unwrap();
        let names: Vec<&str> = report.programs.iter().map(BoundProgram::name).collect();
        assert_eq!(names, vec!["a.lm", "c.lm"]);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path().ends_with("b.lm"));
        assert!(report.failures[0].to_string().starts_with("b.lm:2:"));
    }

    #[test]
    fn conflicting_declaration_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.lm"), "counter shared\n").unwrap();
        std::fs::write(dir.path().join("b.lm"), "gauge shared\n").unwrap();

        let store = MetricStore::new();
        let report = load_dir(dir.path(), &store).unwrap();
        assert_eq!(report.programs.len(), 1);
        assert!(matches!(
            report.failures[0],
            LoadError::Declaration { source: DeclarationError::KindConflict { .. }, .. }
        ));
    }

    #[test]
    fn programs_share_identical_metrics() {
        let store = MetricStore::new();
        let a = load_source(Path::new("a.lm"), "counter hits\n/a/ { hits++ }", &store).unwrap();
        let b = load_source(Path::new("b.lm"), "counter hits\n/b/ { hits++ }", &store).unwrap();
        let line = LogLine { filename: "f", text: "ab" };
        a.run(&line).unwrap();
        b.run(&line).unwrap();
        assert_eq!(store.get("hits").unwrap().get(&[]), Some(Datum::Int(2)));
    }

    #[test]
    fn same_declaration_with_int_and_float_writes() {
        let store = MetricStore::new();
        let a = load_source(Path::new("a.lm"), "gauge g\n/x/ { g = 1 }", &store).unwrap();
        let b = load_source(Path::new("b.lm"), "gauge g\n/y/ { g = 1.5 }", &store).unwrap();

        a.run(&LogLine { filename: "f", text: "x" }).unwrap();
        assert_eq!(store.get("g").unwrap().get(&[]), Some(Datum::Float(1.0)));
        b.run(&LogLine { filename: "f", text: "y" }).unwrap();
        assert_eq!(store.get("g").unwrap().get(&[]), Some(Datum::Float(1.5)));
    }

    #[test]
    fn missing_dir_is_an_error() {
        let store = MetricStore::new();
        let err = load_dir(Path::new("/nonexistent/logmill"), &store).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
