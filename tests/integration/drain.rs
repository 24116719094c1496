#[path = "common/mod.rs"]
mod common;

use std::{
    process::{Command, Stdio},
    sync::{Arc, Mutex, mpsc},
};

use common::CollectingSink;
use lifectl::{
    command::ProcessTag,
    drain::{OutputSink, StreamKind, spawn_drain},
};

#[test]
fn drains_child_pipes_in_order() {
    let mut child = Command::new("sh")
        .args(["-c", "for i in 1 2 3 4 5; do echo out-$i; echo err-$i >&2; done"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let sink = Arc::new(CollectingSink::default());
    let tag = ProcessTag::new("printer");
    let stdout = spawn_drain(
        &tag,
        StreamKind::Stdout,
        child.stdout.take().unwrap(),
        sink.clone(),
    )
    .unwrap();
    let stderr = spawn_drain(
        &tag,
        StreamKind::Stderr,
        child.stderr.take().unwrap(),
        sink.clone(),
    )
    .unwrap();

    assert_eq!(stdout.join().unwrap(), 5);
    assert_eq!(stderr.join().unwrap(), 5);
    child.wait().unwrap();

    assert_eq!(
        sink.output(),
        (1..=5).map(|i| format!("out-{i}")).collect::<Vec<_>>()
    );
    assert_eq!(
        sink.errors(),
        (1..=5).map(|i| format!("err-{i}")).collect::<Vec<_>>()
    );
}

/// Holds every stdout line until the test releases it.
struct GatedSink {
    gate: Mutex<mpsc::Receiver<()>>,
    errors: Mutex<Vec<String>>,
}

impl OutputSink for GatedSink {
    fn report_output(&self, _line: &str) {
        let _ = self.gate.lock().unwrap().recv();
    }

    fn report_error(&self, line: &str) {
        self.errors.lock().unwrap().push(line.to_string());
    }
}

#[test]
fn blocked_stdout_consumer_does_not_stall_stderr() {
    let mut child = Command::new("sh")
        .args(["-c", "echo out; echo err-1 >&2; echo err-2 >&2"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let (release, gate) = mpsc::channel();
    let sink = Arc::new(GatedSink {
        gate: Mutex::new(gate),
        errors: Mutex::new(Vec::new()),
    });
    let tag = ProcessTag::new("gated");
    let stdout = spawn_drain(
        &tag,
        StreamKind::Stdout,
        child.stdout.take().unwrap(),
        sink.clone(),
    )
    .unwrap();
    let stderr = spawn_drain(
        &tag,
        StreamKind::Stderr,
        child.stderr.take().unwrap(),
        sink.clone(),
    )
    .unwrap();

    assert_eq!(stderr.join().unwrap(), 2);
    assert_eq!(*sink.errors.lock().unwrap(), vec!["err-1", "err-2"]);
    assert!(!stdout.is_finished());

    release.send(()).unwrap();
    assert_eq!(stdout.join().unwrap(), 1);
    child.wait().unwrap();
}

#[test]
fn crlf_output_is_trimmed() {
    let mut child = Command::new("sh")
        .args(["-c", "printf 'first\\r\\nsecond\\r\\nlast'"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let sink = Arc::new(CollectingSink::default());
    let handle = spawn_drain(
        &ProcessTag::new("crlf"),
        StreamKind::Stdout,
        child.stdout.take().unwrap(),
        sink.clone(),
    )
    .unwrap();

    assert_eq!(handle.join().unwrap(), 3);
    child.wait().unwrap();
    assert_eq!(sink.output(), vec!["first", "second", "last"]);
    assert!(
        sink.errors().is_empty(),
        "stdout lines must not reach the error channel"
    );
}
