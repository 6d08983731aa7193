//! End-to-end behaviour of the compile → bind → dispatch pipeline.

#![allow(clippy::unwrap_used)]

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use logmill::dispatcher::Dispatcher;
use logmill::dsl::{self, error::ErrorKind};
use logmill::metrics::{Datum, MetricStore};
use logmill::program;
use logmill::source::SourceEvent;

const LOGINS: &str = "counter logins by user\n/^login (\\w+)$/ {\n  logins[$1]++\n}\n";

fn dispatcher(sources: &[&str]) -> Dispatcher {
    let store = Arc::new(MetricStore::new());
    let programs = sources
        .iter()
        .enumerate()
        .map(|(i, src)| program::load_source(Path::new(&format!("p{i}.lm")), src, &store).unwrap())
        .collect();
    Dispatcher::new(store, programs)
}

fn append(path: &Path, text: &str) {
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path).unwrap();
    f.write_all(text.as_bytes()).unwrap();
}

async fn wait_for_lines(d: &Dispatcher, lines: u64) {
    for _ in 0..1000 {
        if d.stats().lines >= lines {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(d.stats().lines, lines);
}

#[test]
fn compilation_is_deterministic() {
    let source = "counter a by k\ngauge g\nconst P /(\\w+)=(\\d+)/\nP {\n  a[$1]++\n  g = $2 * 2.5\n} else {\n  g = 0\n}\n";
    let first = dsl::compile_source("d.lm", source).unwrap();
    let second = dsl::compile_source("d.lm", source).unwrap();
    assert_eq!(first.ops, second.ops);
    assert_eq!(first.constants, second.constants);
    assert_eq!(first.disassemble(), second.disassemble());
}

#[test]
fn non_matching_lines_leave_store_unchanged() {
    let d = dispatcher(&[LOGINS, "gauge last\n/^size (\\d+)$/ { last = $1 }"]);
    d.process_line("auth.log", "login alice");
    let before = serde_json::to_string(&d.store().snapshot(true)).unwrap();

    for text in ["logout alice", "login", "size", "size x", ""] {
        d.process_line("auth.log", text);
    }
    let after = serde_json::to_string(&d.store().snapshot(true)).unwrap();
    assert_eq!(before, after);
    assert_eq!(d.stats().execution_errors, 0);
}

#[test]
fn counter_counts_matching_lines() {
    let d = dispatcher(&["counter foo\n/^GET / { foo++ }"]);
    let k = 37;
    for i in 0..100 {
        let text = if i < k { "GET /index" } else { "POST /form" };
        d.process_line("access.log", text);
    }
    assert_eq!(d.store().get("foo").unwrap().get(&[]), Some(Datum::Int(k)));
}

#[test]
fn string_plus_int_is_a_type_error() {
    let errors = dsl::compile_source("bad.lm", "counter c\nc = \"x\" + 1\n").unwrap_err();
    assert!(!errors.is_empty());
    assert!(errors.iter().all(|e| e.kind == ErrorKind::Type));
}

#[test]
fn login_example() {
    let d = dispatcher(&[LOGINS]);
    for text in ["login alice", "login bob", "login alice"] {
        d.process_line("auth.log", text);
    }
    let snapshot = d.store().get("logins").unwrap().snapshot();
    assert_eq!(snapshot.labels, vec!["user".to_string()]);
    assert_eq!(snapshot.value(&["alice"]), Some(&Datum::Int(2)));
    assert_eq!(snapshot.value(&["bob"]), Some(&Datum::Int(1)));
    assert_eq!(snapshot.entries.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sources_are_additive() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&[LOGINS, "counter total\n/^login / { total++ }"]);

    let per_file = 250;
    for n in 0..4 {
        let path = dir.path().join(format!("auth{n}.log"));
        let text: String = (0..per_file)
            .map(|i| if i % 2 == 0 { "login alice\n" } else { "login bob\n" })
            .collect();
        append(&path, &text);
        d.add_source(&path, true).await;
    }
    d.poke_all().await;
    d.shutdown().await;

    let logins = d.store().get("logins").unwrap();
    assert_eq!(logins.get(&["alice".to_string()]), Some(Datum::Int(500)));
    assert_eq!(logins.get(&["bob".to_string()]), Some(Datum::Int(500)));
    assert_eq!(d.store().get("total").unwrap().get(&[]), Some(Datum::Int(1000)));
    assert_eq!(d.stats().lines, 1000);
}

#[tokio::test]
async fn truncation_with_reset_processes_only_new_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    append(&path, "old 1\nold 2\nold 3\nold 4\nold 5\n");

    let d = dispatcher(&["counter lines\n/.*/ { lines++ }"]);
    d.add_source(&path, true).await;
    d.notify(&path, SourceEvent::Changed).await.unwrap();
    wait_for_lines(&d, 5).await;

    std::fs::write(&path, "").unwrap();
    append(&path, "new 1\nnew 2\n");
    d.notify(&path, SourceEvent::Rotated).await.unwrap();
    d.shutdown().await;

    assert_eq!(d.stats().lines, 7);
    assert_eq!(d.store().get("lines").unwrap().get(&[]), Some(Datum::Int(7)));
}

#[tokio::test]
async fn truncation_is_detected_without_a_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    append(&path, "old 1\nold 2\nold 3\n");

    let d = dispatcher(&["counter lines\n/.*/ { lines++ }"]);
    d.add_source(&path, true).await;
    d.notify(&path, SourceEvent::Changed).await.unwrap();
    wait_for_lines(&d, 3).await;

    std::fs::write(&path, "new\n").unwrap();
    d.notify(&path, SourceEvent::Changed).await.unwrap();
    d.shutdown().await;

    assert_eq!(d.stats().lines, 4);
}

#[test]
fn load_dir_runs_programs_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("logins.lm"), LOGINS).unwrap();
    std::fs::write(dir.path().join("broken.lm"), "counter\n").unwrap();

    let store = Arc::new(MetricStore::new());
    let report = program::load_dir(dir.path(), &store).unwrap();
    assert_eq!(report.programs.len(), 1);
    assert_eq!(report.failures.len(), 1);

    let d = Dispatcher::new(store, report.programs);
    d.process_line("auth.log", "login carol");
    let json = serde_json::to_value(d.store().snapshot(false)).unwrap();
    assert_eq!(json[0]["name"], "logins");
    assert_eq!(json[0]["entries"][0]["labels"][0], "carol");
    assert_eq!(json[0]["entries"][0]["value"], 1);
}
