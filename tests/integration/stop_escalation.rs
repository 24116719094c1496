#[path = "common/mod.rs"]
mod common;

use std::time::{Duration, Instant};

use common::{Behaviour, ControlScripts, EventLog, wait_until};
use lifectl::lifecycle::{ProcessLifecycle, StopTimeout};
use tempfile::tempdir;

#[test]
fn stop_escalates_to_kill_after_timeout() {
    let temp = tempdir().unwrap();
    let scripts = ControlScripts::install(
        temp.path(),
        Behaviour {
            stubborn: true,
            ..Behaviour::default()
        },
    );
    let lifecycle = ProcessLifecycle::builder("stubborn")
        .layout(scripts.layout())
        .stop_timeout(StopTimeout::After(Duration::from_millis(300)))
        .confirm_interval(Duration::from_millis(50))
        .build();
    let events = EventLog::new();
    lifecycle.add_listener(events.clone());

    lifecycle.start();
    assert!(wait_until(Duration::from_secs(5), || lifecycle.is_running()));

    let begun = Instant::now();
    lifecycle.stop();
    assert!(begun.elapsed() >= Duration::from_millis(300));
    assert!(!lifecycle.is_running());

    let calls = scripts.calls();
    let first_kill = calls
        .iter()
        .position(|call| call == "kill")
        .expect("stop loop should have escalated");
    assert!(first_kill >= 2, "expected graceful attempts first: {calls:?}");
    assert!(calls[1..first_kill].iter().all(|call| call == "stop"));

    // Escalation stays within the graceful stop transition.
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
fn never_timeout_keeps_asking_gracefully() {
    let temp = tempdir().unwrap();
    let scripts = ControlScripts::install(
        temp.path(),
        Behaviour {
            stop_on_request: Some(3),
            ..Behaviour::default()
        },
    );
    let lifecycle = ProcessLifecycle::builder("patient")
        .layout(scripts.layout())
        .stop_timeout(StopTimeout::from_millis(-1))
        .confirm_interval(Duration::from_millis(20))
        .build();

    lifecycle.start();
    assert!(wait_until(Duration::from_secs(5), || lifecycle.is_running()));

    lifecycle.stop();

    assert!(!lifecycle.is_running());
    assert_eq!(scripts.calls(), vec!["start", "stop", "stop", "stop"]);
}

#[test]
fn zero_timeout_kills_on_first_iteration() {
    let temp = tempdir().unwrap();
    let scripts = ControlScripts::install(temp.path(), Behaviour::default());
    let lifecycle = ProcessLifecycle::builder("hasty")
        .layout(scripts.layout())
        .stop_timeout(StopTimeout::After(Duration::ZERO))
        .confirm_interval(Duration::from_millis(20))
        .build();

    lifecycle.start();
    assert!(wait_until(Duration::from_secs(5), || lifecycle.is_running()));

    lifecycle.stop();

    assert!(!lifecycle.is_running());
    assert_eq!(scripts.calls(), vec!["start", "kill"]);
}
