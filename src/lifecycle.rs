//! Lifecycle controller for a process managed through delegate control scripts.
//!
//! Control scripts only *request* transitions; the `running` script is the single
//! source of truth for liveness, so every protocol here re-polls it instead of
//! trusting a script's exit code.
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::Deserialize;
use tracing::{debug, error, info, trace, warn};

use crate::{
    command::{ControlCommand, Operation, ProcessTag, ScriptLayout},
    drain::{OutputSink, StreamKind, spawn_drain},
    invoker::{ScriptInvoker, ScriptProcess, ShellScriptInvoker, StdioPlan, StreamMode, WaitError},
    listener::{LifecycleListener, ListenerId, ListenerRegistry, TransitionEvent},
};

/// Pause between a still-running poll and the next stop/kill iteration.
pub const DEFAULT_CONFIRM_INTERVAL: Duration = Duration::from_millis(100);

/// When the stop loop switches from `stop` to `kill`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopTimeout {
    /// Keep asking gracefully forever.
    #[default]
    Never,
    /// Escalate to `kill` once this much time has passed since the first attempt.
    After(Duration),
}

impl StopTimeout {
    /// Negative values mean "never escalate".
    pub fn from_millis(millis: i64) -> Self {
        if millis < 0 {
            StopTimeout::Never
        } else {
            StopTimeout::After(Duration::from_millis(millis as u64))
        }
    }

    /// Picks the operation for a loop iteration that began at `now`.
    ///
    /// A deadline past the end of the clock's range is never reached.
    pub fn operation_at(&self, started: Instant, now: Instant) -> Operation {
        let deadline = match self {
            StopTimeout::Never => None,
            StopTimeout::After(timeout) => started.checked_add(*timeout),
        };
        match deadline {
            Some(deadline) if now >= deadline => Operation::Kill,
            _ => Operation::Stop,
        }
    }
}

/// Answer `is_running()` gives when waiting for the `running` script was
/// interrupted and its exit status cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnconfirmedLiveness {
    /// Report running, so no conflicting concurrent start is issued.
    #[default]
    AssumeRunning,
    /// Report stopped.
    AssumeStopped,
}

impl UnconfirmedLiveness {
    fn resolve(self) -> bool {
        matches!(self, UnconfirmedLiveness::AssumeRunning)
    }
}

/// Which streams of the start script are captured when a sink is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Capture {
    pub stdout: bool,
    pub stderr: bool,
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            stdout: true,
            stderr: true,
        }
    }
}

/// The process launched by the most recent `start`, plus its drain workers.
pub struct RunningChild {
    process: Box<dyn ScriptProcess>,
    drains: Vec<(StreamKind, JoinHandle<usize>)>,
}

impl RunningChild {
    pub fn id(&self) -> Option<u32> {
        self.process.id()
    }

    /// Reaps the start script if it already finished.
    fn reap(&mut self) {
        match self.process.try_wait() {
            Ok(Some(exit)) => debug!("Superseded start script exited with {exit:?}"),
            Ok(None) => debug!("Superseded start script is still running"),
            Err(err) => warn!("Failed to query superseded start script: {err}"),
        }
    }
}

impl fmt::Debug for RunningChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningChild")
            .field("pid", &self.process.id())
            .field("drains", &self.drains.len())
            .finish()
    }
}

/// Lines forwarded by each drain worker of a child, as returned by
/// [`ProcessLifecycle::join_drains`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub stdout: Option<usize>,
    pub stderr: Option<usize>,
}

struct Inner {
    tag: ProcessTag,
    command: Vec<String>,
    environment: BTreeMap<String, String>,
    stop_timeout: StopTimeout,
    confirm_interval: Duration,
    unconfirmed: UnconfirmedLiveness,
    capture: Capture,
    invoker: Arc<dyn ScriptInvoker>,
    sink: Option<Arc<dyn OutputSink>>,
    listeners: ListenerRegistry,
    child: Mutex<Option<RunningChild>>,
}

/// Starts, stops and kills an externally managed process via control scripts.
///
/// Cloning yields another handle to the same controller. Lifecycle calls are
/// expected to be serialized by the owner; only listener (un)registration is
/// safe to interleave freely.
#[derive(Clone)]
pub struct ProcessLifecycle {
    inner: Arc<Inner>,
}

impl ProcessLifecycle {
    pub fn builder(tag: impl Into<ProcessTag>) -> LifecycleBuilder {
        LifecycleBuilder::new(tag.into())
    }

    pub fn tag(&self) -> &ProcessTag {
        &self.inner.tag
    }

    pub fn stop_timeout(&self) -> StopTimeout {
        self.inner.stop_timeout
    }

    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Starts the process unless it is already running.
    pub fn start(&self) {
        if self.is_running() {
            warn!("Process '{}' is already running", self.inner.tag);
            return;
        }
        info!("Starting process '{}'", self.inner.tag);
        let _after = self.transition(
            TransitionEvent::BeforeStart,
            TransitionEvent::AfterStart,
        );
        self.start_internal();
    }

    /// Gracefully stops the process, escalating to `kill` after the stop timeout.
    pub fn stop(&self) {
        if !self.is_running() {
            warn!("Process '{}' is not running, cannot stop", self.inner.tag);
            return;
        }
        info!("Stopping process '{}'", self.inner.tag);
        let _after = self.transition(
            TransitionEvent::BeforeStop { graceful: true },
            TransitionEvent::AfterStop { graceful: true },
        );
        self.inner.stop_loop();
    }

    /// Kills the process and blocks until it is confirmed gone.
    pub fn kill(&self) {
        info!("Killing process '{}'", self.inner.tag);
        let _after = self.transition(
            TransitionEvent::BeforeStop { graceful: false },
            TransitionEvent::AfterStop { graceful: false },
        );
        if let Some(waiter) = self.inner.request_kill() {
            waiter.run();
        }
    }

    /// Requests a kill and returns immediately.
    ///
    /// Confirmation runs on a background thread which fires `after_stop(false)`
    /// once the process is gone. If the kill request cannot be issued,
    /// `after_stop(false)` fires on the calling thread before returning.
    pub fn kill_async(&self) {
        info!("Killing process '{}' asynchronously", self.inner.tag);
        let after = self.transition(
            TransitionEvent::BeforeStop { graceful: false },
            TransitionEvent::AfterStop { graceful: false },
        );
        let Some(waiter) = self.inner.request_kill() else {
            return;
        };

        // The slot lets us take the guard back if the thread never starts.
        let slot = Arc::new(Mutex::new(Some((waiter, after))));
        let worker_slot = slot.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-stop-listener-invoker", self.inner.tag))
            .spawn(move || {
                let job = worker_slot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some((waiter, _after)) = job {
                    waiter.run();
                }
            });

        if let Err(err) = spawned {
            error!("Failed to spawn kill confirmation thread: {err}; confirming inline");
            let job = slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some((waiter, _after)) = job {
                waiter.run();
            }
        }
    }

    /// Asks the `running` script whether the process is alive.
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// PID of the most recent start script, if one is held.
    pub fn child_id(&self) -> Option<u32> {
        self.inner.child().as_ref().and_then(RunningChild::id)
    }

    /// Blocks until the current child's drain workers reach end-of-stream.
    pub fn join_drains(&self) -> DrainReport {
        let drains = match self.inner.child().as_mut() {
            Some(child) => std::mem::take(&mut child.drains),
            None => Vec::new(),
        };

        let mut report = DrainReport::default();
        for (kind, handle) in drains {
            let lines = match handle.join() {
                Ok(lines) => lines,
                Err(_) => {
                    error!("{kind} drain worker for '{}' panicked", self.inner.tag);
                    continue;
                }
            };
            match kind {
                StreamKind::Stdout => report.stdout = Some(lines),
                StreamKind::Stderr => report.stderr = Some(lines),
            }
        }
        report
    }

    fn transition(&self, before: TransitionEvent, after: TransitionEvent) -> AfterGuard {
        self.inner.listeners.notify(before);
        AfterGuard {
            inner: self.inner.clone(),
            event: after,
        }
    }

    fn start_internal(&self) {
        let inner = &self.inner;
        let command = ControlCommand::start(&inner.tag, &inner.command, &inner.environment);
        info!("Environment:\n{:?}", command.environment());
        info!("Starting with: {}", inner.invoker.describe(&command));

        let plan = inner.stdio_plan();
        let mut process = match inner.invoker.launch(&command, plan) {
            Ok(process) => process,
            Err(err) => {
                error!("Failed to start '{}': {err}", inner.tag);
                return;
            }
        };

        let mut drains = Vec::new();
        if let Some(sink) = inner.sink.as_ref() {
            let pipes = [
                (StreamKind::Stdout, process.take_stdout()),
                (StreamKind::Stderr, process.take_stderr()),
            ];
            for (kind, pipe) in pipes {
                let Some(reader) = pipe else { continue };
                match spawn_drain(&inner.tag, kind, reader, sink.clone()) {
                    Ok(handle) => drains.push((kind, handle)),
                    Err(err) => error!("Failed to spawn {kind} drain for '{}': {err}", inner.tag),
                }
            }
        }

        let mut slot = inner.child();
        if let Some(previous) = slot.as_mut() {
            previous.reap();
        }
        *slot = Some(RunningChild { process, drains });
    }
}

impl fmt::Debug for ProcessLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLifecycle")
            .field("tag", &self.inner.tag)
            .field("stop_timeout", &self.inner.stop_timeout)
            .field("listeners", &self.inner.listeners)
            .finish()
    }
}

impl Inner {
    fn child(&self) -> MutexGuard<'_, Option<RunningChild>> {
        self.child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stdio_plan(&self) -> StdioPlan {
        let mode = |captured: bool| {
            if self.sink.is_some() && captured {
                StreamMode::Piped
            } else {
                StreamMode::Inherit
            }
        };
        StdioPlan {
            stdout: mode(self.capture.stdout),
            stderr: mode(self.capture.stderr),
        }
    }

    fn launch_tag_only(
        &self,
        operation: Operation,
    ) -> Result<Box<dyn ScriptProcess>, crate::error::LifecycleError> {
        let command = ControlCommand::tag_only(operation, &self.tag);
        trace!("Invoking {}", self.invoker.describe(&command));
        self.invoker.launch(&command, StdioPlan::inherit())
    }

    fn is_running(&self) -> bool {
        let mut process = match self.launch_tag_only(Operation::Running) {
            Ok(process) => process,
            Err(err) => {
                error!("Cannot determine if '{}' is running: {err}", self.tag);
                return false;
            }
        };

        match process.wait() {
            Ok(exit) => exit.success(),
            Err(WaitError::Interrupted) => {
                error!("Interrupted waiting for running script of '{}'", self.tag);
                match process.try_wait() {
                    Ok(Some(exit)) => exit.success(),
                    _ => self.unconfirmed.resolve(),
                }
            }
            Err(WaitError::Io(err)) => {
                error!("Failed waiting for running script of '{}': {err}", self.tag);
                self.unconfirmed.resolve()
            }
        }
    }

    /// Waits for a `stop`/`kill` script to exit. Failures are logged and ignored
    /// because liveness is re-polled right after.
    fn settle(&self, operation: Operation, process: &mut dyn ScriptProcess) {
        match process.wait() {
            Ok(exit) if !exit.success() => {
                debug!("{operation} script for '{}' exited with {exit:?}", self.tag)
            }
            Ok(_) => {}
            Err(err) => trace!("Waiting for {operation} script of '{}': {err}", self.tag),
        }
    }

    fn pause(&self) {
        if !self.confirm_interval.is_zero() {
            thread::sleep(self.confirm_interval);
        }
    }

    /// Repeats `stop` (then `kill` past the timeout) until `running` reports
    /// the process gone. There is no iteration cap.
    fn stop_loop(&self) {
        let started = Instant::now();
        let mut escalated = false;
        loop {
            let operation = self.stop_timeout.operation_at(started, Instant::now());
            if operation == Operation::Kill && !escalated {
                warn!(
                    "Process '{}' did not stop within {:?}; escalating to kill",
                    self.tag, self.stop_timeout
                );
                escalated = true;
            }

            let mut process = match self.launch_tag_only(operation) {
                Ok(process) => process,
                Err(err) => {
                    error!("Cannot stop '{}': {err}", self.tag);
                    return;
                }
            };
            self.settle(operation, process.as_mut());

            if !self.is_running() {
                info!("Process '{}' stopped", self.tag);
                return;
            }
            self.pause();
        }
    }

    /// Launches the kill script and hands back a waiter that confirms the kill.
    fn request_kill(self: &Arc<Self>) -> Option<KillWaiter> {
        if !self.is_running() {
            warn!("Cannot kill '{}', process is not running", self.tag);
            return None;
        }
        match self.launch_tag_only(Operation::Kill) {
            Ok(process) => Some(KillWaiter {
                inner: self.clone(),
                process,
            }),
            Err(err) => {
                error!("Cannot kill '{}': {err}", self.tag);
                None
            }
        }
    }
}

/// Blocks until the kill script exits and `running` reports the process gone.
struct KillWaiter {
    inner: Arc<Inner>,
    process: Box<dyn ScriptProcess>,
}

impl KillWaiter {
    fn run(mut self) {
        loop {
            self.inner.settle(Operation::Kill, self.process.as_mut());
            if !self.inner.is_running() {
                info!("Process '{}' killed", self.inner.tag);
                return;
            }
            self.inner.pause();
        }
    }
}

/// Fires the "after" event of a transition when dropped, including on unwind.
struct AfterGuard {
    inner: Arc<Inner>,
    event: TransitionEvent,
}

impl Drop for AfterGuard {
    fn drop(&mut self) {
        self.inner.listeners.notify(self.event);
    }
}

/// Builder for [`ProcessLifecycle`].
pub struct LifecycleBuilder {
    tag: ProcessTag,
    layout: ScriptLayout,
    command: Vec<String>,
    environment: BTreeMap<String, String>,
    stop_timeout: StopTimeout,
    confirm_interval: Duration,
    unconfirmed: UnconfirmedLiveness,
    capture: Capture,
    invoker: Option<Arc<dyn ScriptInvoker>>,
    sink: Option<Arc<dyn OutputSink>>,
}

impl LifecycleBuilder {
    fn new(tag: ProcessTag) -> Self {
        Self {
            tag,
            layout: ScriptLayout::default(),
            command: Vec::new(),
            environment: BTreeMap::new(),
            stop_timeout: StopTimeout::default(),
            confirm_interval: DEFAULT_CONFIRM_INTERVAL,
            unconfirmed: UnconfirmedLiveness::default(),
            capture: Capture::default(),
            invoker: None,
            sink: None,
        }
    }

    /// Script location used by the default [`ShellScriptInvoker`].
    pub fn layout(mut self, layout: ScriptLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Arguments passed to the `start` script after the tag.
    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.environment.extend(vars);
        self
    }

    pub fn stop_timeout(mut self, timeout: StopTimeout) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn confirm_interval(mut self, interval: Duration) -> Self {
        self.confirm_interval = interval;
        self
    }

    pub fn unconfirmed_liveness(mut self, policy: UnconfirmedLiveness) -> Self {
        self.unconfirmed = policy;
        self
    }

    pub fn capture(mut self, capture: Capture) -> Self {
        self.capture = capture;
        self
    }

    /// Replaces the default [`ShellScriptInvoker`].
    pub fn invoker(mut self, invoker: Arc<dyn ScriptInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Registers the sink that captured output and error lines are forwarded to.
    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> ProcessLifecycle {
        let invoker = self
            .invoker
            .unwrap_or_else(|| Arc::new(ShellScriptInvoker::new(self.layout)));
        ProcessLifecycle {
            inner: Arc::new(Inner {
                tag: self.tag,
                command: self.command,
                environment: self.environment,
                stop_timeout: self.stop_timeout,
                confirm_interval: self.confirm_interval,
                unconfirmed: self.unconfirmed,
                capture: self.capture,
                invoker,
                sink: self.sink,
                listeners: ListenerRegistry::new(),
                child: Mutex::new(None),
            }),
        }
    }
}
