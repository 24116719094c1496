#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path, time::Duration};

use assert_cmd::Command;
use common::{Behaviour, ControlScripts, wait_until};
use predicates::prelude::*;
use tempfile::tempdir;

fn write_config(dir: &Path, tag: &str) -> String {
    let config_path = dir.join("lifectl.yaml");
    fs::write(
        &config_path,
        format!(
            r#"version: "1"
process:
  tag: "{tag}"
  scripts:
    prefix: "scripts/"
    suffix: ".sh"
  command: ["--role", "primary"]
  env:
    vars:
      MODE: "cli"
  stop_timeout: 2s
  confirm_interval: 50ms
"#
        ),
    )
    .unwrap();
    config_path.to_str().unwrap().to_string()
}

fn lifectl() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("lifectl"))
}

fn status_output(config: &str) -> String {
    let output = lifectl()
        .args(["status", "--config", config])
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[test]
fn status_reports_stopped_process() {
    let temp = tempdir().unwrap();
    let _scripts = ControlScripts::install(temp.path(), Behaviour::default());
    let config = write_config(temp.path(), "svc-idle");

    lifectl()
        .args(["status", "--config", &config])
        .assert()
        .success()
        .stdout(predicate::str::diff("svc-idle: stopped\n"));

    lifectl()
        .args(["status", "--config", &config, "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""running":false"#))
        .stdout(predicate::str::contains(r#""tag":"svc-idle""#));
}

#[test]
fn start_status_stop_round_trip() {
    let temp = tempdir().unwrap();
    let scripts = ControlScripts::install(temp.path(), Behaviour::default());
    let config = write_config(temp.path(), "svc-main");

    lifectl()
        .args(["start", "--config", &config])
        .assert()
        .success()
        .stdout(predicate::str::contains("starting svc-main --role primary"));

    assert!(wait_until(Duration::from_secs(5), || {
        status_output(&config) == "svc-main: running"
    }));

    lifectl()
        .args(["status", "--config", &config, "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""running":true"#));

    lifectl()
        .args(["stop", "--config", &config])
        .assert()
        .success();

    assert_eq!(status_output(&config), "svc-main: stopped");
    assert_eq!(scripts.calls(), vec!["start", "stop"]);
}

#[test]
fn follow_forwards_start_output_to_logs() {
    let temp = tempdir().unwrap();
    let _scripts = ControlScripts::install(temp.path(), Behaviour::default());
    let config = write_config(temp.path(), "svc-follow");

    lifectl()
        .args(["start", "--config", &config, "--follow", "--log-level", "info"])
        .assert()
        .success()
        .stderr(predicate::str::contains("mode=cli"))
        .stderr(predicate::str::contains("warming up"));

    lifectl()
        .args(["kill", "--config", &config])
        .assert()
        .success();
    assert_eq!(status_output(&config), "svc-follow: stopped");
}

#[test]
fn kill_without_running_process_succeeds() {
    let temp = tempdir().unwrap();
    let scripts = ControlScripts::install(temp.path(), Behaviour::default());
    let config = write_config(temp.path(), "svc-none");

    lifectl()
        .args(["kill", "--config", &config])
        .assert()
        .success();
    assert!(scripts.calls().is_empty());
}

#[test]
fn missing_config_fails() {
    let temp = tempdir().unwrap();
    let missing = temp.path().join("absent.yaml");

    lifectl()
        .args(["status", "--config", missing.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("absent.yaml"));
}

#[test]
fn rejects_unknown_log_level() {
    lifectl()
        .args(["status", "--log-level", "loud"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid log level"));
}
