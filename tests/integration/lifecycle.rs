#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    sync::{Arc, mpsc},
    time::Duration,
};

use common::{Behaviour, CollectingSink, ControlScripts, EventLog, wait_until};
use lifectl::{
    config::load_config,
    error::ListenerError,
    lifecycle::{ProcessLifecycle, StopTimeout},
    listener::LifecycleListener,
};
use tempfile::tempdir;

#[test]
fn start_and_stop_with_shell_scripts() {
    let temp = tempdir().unwrap();
    let scripts = ControlScripts::install(temp.path(), Behaviour::default());
    let sink = Arc::new(CollectingSink::default());

    let lifecycle = ProcessLifecycle::builder("node-1")
        .layout(scripts.layout())
        .command(["server", "--port", "7000"])
        .env("MODE", "inline")
        .confirm_interval(Duration::from_millis(50))
        .sink(sink.clone())
        .build();
    let events = EventLog::new();
    lifecycle.add_listener(events.clone());

    assert!(!lifecycle.is_running());

    lifecycle.start();
    let report = lifecycle.join_drains();
    assert_eq!(report.stdout, Some(2));
    assert_eq!(report.stderr, Some(1));
    assert_eq!(
        sink.output(),
        vec!["starting node-1 server --port 7000", "mode=inline"]
    );
    assert_eq!(sink.errors(), vec!["warming up"]);

    assert!(wait_until(Duration::from_secs(5), || lifecycle.is_running()));

    lifecycle.stop();
    assert!(!lifecycle.is_running());
    assert_eq!(scripts.calls(), vec!["start", "stop"]);
    assert_eq!(
        events.events(),
        vec![
            "before_start",
            "after_start",
            "before_stop(true)",
            "after_stop(true)"
        ]
    );
}

#[test]
fn kill_forces_shell_managed_process_down() {
    let temp = tempdir().unwrap();
    let scripts = ControlScripts::install(temp.path(), Behaviour::default());
    let lifecycle = ProcessLifecycle::builder("node-2")
        .layout(scripts.layout())
        .confirm_interval(Duration::from_millis(50))
        .build();

    lifecycle.start();
    assert!(wait_until(Duration::from_secs(5), || lifecycle.is_running()));

    lifecycle.kill();
    assert!(!lifecycle.is_running());
    assert_eq!(scripts.calls(), vec!["start", "kill"]);
}

struct StoppedSignal(std::sync::Mutex<mpsc::Sender<bool>>);

impl LifecycleListener for StoppedSignal {
    fn after_stop(&self, graceful: bool) -> Result<(), ListenerError> {
        self.0
            .lock()
            .unwrap()
            .send(graceful)
            .map_err(|err| ListenerError::Failed(err.to_string()))
    }
}

#[test]
fn kill_async_confirms_stop_in_background() {
    let temp = tempdir().unwrap();
    let scripts = ControlScripts::install(temp.path(), Behaviour::default());
    let lifecycle = ProcessLifecycle::builder("node-3")
        .layout(scripts.layout())
        .confirm_interval(Duration::from_millis(50))
        .build();

    lifecycle.start();
    assert!(wait_until(Duration::from_secs(5), || lifecycle.is_running()));

    let (tx, rx) = mpsc::channel();
    lifecycle.add_listener(Arc::new(StoppedSignal(std::sync::Mutex::new(tx))));

    lifecycle.kill_async();
    let graceful = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("after_stop should fire once the process is gone");
    assert!(!graceful);
    assert!(!lifecycle.is_running());
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn stop_without_running_process_invokes_nothing() {
    let temp = tempdir().unwrap();
    let scripts = ControlScripts::install(temp.path(), Behaviour::default());
    let lifecycle = ProcessLifecycle::builder("idle")
        .layout(scripts.layout())
        .build();
    let events = EventLog::new();
    lifecycle.add_listener(events.clone());

    lifecycle.stop();

    assert!(scripts.calls().is_empty());
    assert!(events.events().is_empty());
}

#[test]
fn missing_scripts_leave_controller_usable() {
    let temp = tempdir().unwrap();
    let lifecycle = ProcessLifecycle::builder("ghost")
        .layout(lifectl::command::ScriptLayout::new(
            format!("{}/nowhere/", temp.path().display()),
            ".sh",
        ))
        .stop_timeout(StopTimeout::After(Duration::ZERO))
        .build();
    let events = EventLog::new();
    lifecycle.add_listener(events.clone());

    lifecycle.start();
    assert!(!lifecycle.is_running());
    lifecycle.kill();

    assert_eq!(
        events.events(),
        vec![
            "before_start",
            "after_start",
            "before_stop(false)",
            "after_stop(false)"
        ]
    );
}

#[test]
fn configured_process_runs_through_full_cycle() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let scripts = ControlScripts::install(dir, Behaviour::default());
    fs::write(dir.join("node.env"), "MODE=from-file\n").unwrap();
    fs::write(
        dir.join("lifectl.yaml"),
        r#"
version: "1"
process:
  tag: "cfg-node"
  scripts:
    prefix: "scripts/"
    suffix: ".sh"
  command: ["--replica", "2"]
  env:
    file: "node.env"
  stop_timeout: 5s
  confirm_interval: 50ms
"#,
    )
    .unwrap();

    let config_path = dir.join("lifectl.yaml");
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    let sink = Arc::new(CollectingSink::default());
    let lifecycle = config.build_lifecycle(Some(sink.clone())).unwrap();

    assert_eq!(
        lifecycle.stop_timeout(),
        StopTimeout::After(Duration::from_secs(5))
    );

    lifecycle.start();
    lifecycle.join_drains();
    assert_eq!(
        sink.output(),
        vec!["starting cfg-node --replica 2", "mode=from-file"]
    );
    assert!(wait_until(Duration::from_secs(5), || lifecycle.is_running()));
    assert!(scripts.pid("cfg-node").is_some());

    lifecycle.stop();
    assert!(!lifecycle.is_running());
    assert_eq!(scripts.calls(), vec!["start", "stop"]);
}
