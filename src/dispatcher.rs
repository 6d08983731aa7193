use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dsl::LogLine;
use crate::metrics::MetricStore;
use crate::program::{self, BoundProgram, LoadError, LoadReport};
use crate::source::{LogSource, SourceError, SourceEvent};

/// Pending notifications per source. A full queue already holds a `Changed`
/// that will pick up any new data, so further ones are dropped.
const EVENT_QUEUE: usize = 16;

/// Feeds lines from tailed sources into the loaded programs.
///
/// Each source gets its own task, so sources are processed in parallel while
/// the lines of one source are processed strictly in order. Every line runs
/// through every program, in load order, against the program set that was
/// active when the line was read. The store is the only state the tasks share.
pub struct Dispatcher {
    shared: Arc<Shared>,
    sources: Mutex<IndexMap<PathBuf, SourceTask>>,
    closed: AtomicBool,
}

struct SourceTask {
    events: mpsc::Sender<SourceEvent>,
    handle: JoinHandle<()>,
}

struct Shared {
    store: Arc<MetricStore>,
    programs: RwLock<Arc<Vec<BoundProgram>>>,
    lines: AtomicU64,
    errors: AtomicU64,
}

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Lines run through the program set.
    pub lines: u64,
    /// Program executions that ended in a runtime fault.
    pub execution_errors: u64,
}

impl Shared {
    fn process_line(&self, filename: &str, text: &str) {
        let programs = Arc::clone(&self.programs.read());
        let line = LogLine { filename, text };
        for program in programs.iter() {
            if let Err(e) = program.run(&line) {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(source = filename, "{e}");
            }
        }
        self.lines.fetch_add(1, Ordering::Relaxed);
    }
}

impl Dispatcher {
    pub fn new(store: Arc<MetricStore>, programs: Vec<BoundProgram>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                programs: RwLock::new(Arc::new(programs)),
                lines: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
            sources: Mutex::new(IndexMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.shared.store
    }

    /// The active program set.
    pub fn programs(&self) -> Arc<Vec<BoundProgram>> {
        Arc::clone(&self.shared.programs.read())
    }

    /// Atomically replace the program set. Lines already being processed
    /// finish with the old set; the next line sees the new one.
    pub fn swap_programs(&self, programs: Vec<BoundProgram>) -> Arc<Vec<BoundProgram>> {
        let names: Vec<&str> = programs.iter().map(BoundProgram::name).collect();
        tracing::info!(programs = ?names, "swapping program set");
        std::mem::replace(&mut *self.shared.programs.write(), Arc::new(programs))
    }

    /// Recompile every program in `dir` and swap in the ones that load.
    /// Metrics and their values survive the reload.
    pub fn reload(&self, dir: &Path) -> Result<LoadReport, LoadError> {
        let report = program::load_dir(dir, &self.shared.store)?;
        self.swap_programs(report.programs.clone());
        Ok(report)
    }

    /// Run one line through the active program set on the calling thread.
    pub fn process_line(&self, filename: &str, text: &str) {
        self.shared.process_line(filename, text);
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            lines: self.shared.lines.load(Ordering::Relaxed),
            execution_errors: self.shared.errors.load(Ordering::Relaxed),
        }
    }

    /// Start tailing `path`. Adding a path twice, or after shutdown, is a
    /// no-op.
    pub async fn add_source(&self, path: impl Into<PathBuf>, from_start: bool) {
        let path = path.into();
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(source = %path.display(), "dispatcher is shut down, not tailing source");
            return;
        }
        if self.sources.lock().contains_key(&path) {
            return;
        }
        let source = LogSource::open(path.clone(), from_start).await;
        let (events, rx) = mpsc::channel(EVENT_QUEUE);
        let shared = Arc::clone(&self.shared);

        let mut sources = self.sources.lock();
        if sources.contains_key(&path) || self.closed.load(Ordering::Acquire) {
            return;
        }
        tracing::info!(source = %path.display(), offset = source.offset(), "tailing source");
        let handle = tokio::spawn(run_source(source, rx, shared));
        sources.insert(path, SourceTask { events, handle });
    }

    pub fn source_paths(&self) -> Vec<PathBuf> {
        self.sources.lock().keys().cloned().collect()
    }

    /// Deliver an event to a source's task. `Changed` never waits: if the
    /// queue is full the task will see the new data anyway. `Rotated` waits
    /// for queue space so it is never lost.
    pub async fn notify(&self, path: &Path, event: SourceEvent) -> Result<(), SourceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SourceError::Closed(path.to_path_buf()));
        }
        let events = self
            .sources
            .lock()
            .get(path)
            .map(|t| t.events.clone())
            .ok_or_else(|| SourceError::Unknown(path.to_path_buf()))?;
        let closed = || SourceError::Closed(path.to_path_buf());
        match event {
            SourceEvent::Changed => match events.try_send(event) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(closed()),
            },
            SourceEvent::Rotated => events.send(event).await.map_err(|_| closed()),
        }
    }

    /// Notify every source that new data may be available.
    pub async fn poke_all(&self) {
        for path in self.source_paths() {
            if let Err(e) = self.notify(&path, SourceEvent::Changed).await {
                tracing::debug!("{e}");
            }
        }
    }

    /// Stop accepting events, then wait for every source task to finish the
    /// events already queued.
    pub async fn shutdown(&self) {
        let tasks: Vec<(PathBuf, SourceTask)> = {
            let mut sources = self.sources.lock();
            self.closed.store(true, Ordering::Release);
            sources.drain(..).collect()
        };
        tracing::info!(sources = tasks.len(), "shutting down dispatcher");
        for (path, task) in tasks {
            drop(task.events);
            if let Err(e) = task.handle.await {
                tracing::error!(source = %path.display(), "source task failed: {e}");
            }
        }
        let stats = self.stats();
        tracing::info!(lines = stats.lines, execution_errors = stats.execution_errors, "dispatcher stopped");
    }
}

async fn run_source(mut source: LogSource, mut events: mpsc::Receiver<SourceEvent>, shared: Arc<Shared>) {
    while let Some(event) = events.recv().await {
        if event == SourceEvent::Rotated {
            tracing::info!(source = source.name(), "rotation reported, reading from the start");
            source.reset();
        }
        // One chunk at a time, so a large backlog is never held in memory whole.
        loop {
            let lines = match source.read_lines().await {
                Ok(lines) if lines.is_empty() => break,
                Ok(lines) => lines,
                Err(e) => {
                    tracing::warn!("{e}");
                    break;
                }
            };
            for line in lines {
                shared.process_line(source.name(), &line.text);
                source.commit(line.end);
            }
        }
    }
    tracing::debug!(source = source.name(), offset = source.offset(), "source task finished");
}
