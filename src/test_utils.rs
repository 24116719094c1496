//! Helpers shared by unit and integration tests.
use std::{
    collections::HashSet,
    io::{self, Cursor},
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
    thread,
    time::Duration,
};

use crate::{
    command::{ControlCommand, Operation},
    error::LifecycleError,
    invoker::{PipeReader, ScriptExit, ScriptInvoker, ScriptProcess, StdioPlan, StreamMode, WaitError},
};

/// Global lock for environment variable modifications in tests.
/// All tests that modify environment variables should acquire this lock
/// to prevent race conditions between parallel test executions.
pub static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct FakeState {
    running: bool,
    polls_after_stop: usize,
    countdown: Option<usize>,
    ignore_stop: bool,
    failing: HashSet<Operation>,
    interrupt_running: bool,
    kill_delay: Duration,
    stdout: Vec<String>,
    stderr: Vec<String>,
    invocations: Vec<ControlCommand>,
}

/// In-memory [`ScriptInvoker`] simulating a controlled process.
///
/// `start` marks the process alive. The first `stop` (unless ignored) or
/// `kill` arms a countdown: the next `polls_after_stop` `running` queries still
/// report alive, the one after reports stopped.
#[derive(Default)]
pub struct FakeInvoker {
    state: Mutex<FakeState>,
}

impl FakeInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin with the process already alive.
    pub fn running(self) -> Self {
        self.lock().running = true;
        self
    }

    pub fn stops_after_polls(self, polls: usize) -> Self {
        self.lock().polls_after_stop = polls;
        self
    }

    /// Graceful `stop` requests have no effect; only `kill` works.
    pub fn ignoring_stop(self) -> Self {
        self.lock().ignore_stop = true;
        self
    }

    /// Launching `operation` fails as if the script were missing.
    pub fn failing(self, operation: Operation) -> Self {
        self.lock().failing.insert(operation);
        self
    }

    /// Waits on `running` report interruption with no readable exit status.
    pub fn interrupting_running_waits(self) -> Self {
        self.lock().interrupt_running = true;
        self
    }

    /// Waiting on a `kill` script blocks this long.
    pub fn kill_delay(self, delay: Duration) -> Self {
        self.lock().kill_delay = delay;
        self
    }

    /// Lines the start script writes to its captured streams.
    pub fn with_output(self, stdout: &[&str], stderr: &[&str]) -> Self {
        {
            let mut state = self.lock();
            state.stdout = stdout.iter().map(|s| s.to_string()).collect();
            state.stderr = stderr.iter().map(|s| s.to_string()).collect();
        }
        self
    }

    pub fn set_running(&self, running: bool) {
        let mut state = self.lock();
        state.running = running;
        state.countdown = None;
    }

    /// Current simulated liveness, without counting as a poll.
    pub fn is_alive(&self) -> bool {
        self.lock().running
    }

    pub fn invocations(&self) -> Vec<ControlCommand> {
        self.lock().invocations.clone()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.lock()
            .invocations
            .iter()
            .map(ControlCommand::operation)
            .collect()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.lock()
            .invocations
            .iter()
            .filter(|command| command.operation() == operation)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ScriptInvoker for FakeInvoker {
    fn launch(
        &self,
        command: &ControlCommand,
        stdio: StdioPlan,
    ) -> Result<Box<dyn ScriptProcess>, LifecycleError> {
        let mut state = self.lock();
        let operation = command.operation();
        state.invocations.push(command.clone());

        if state.failing.contains(&operation) {
            return Err(LifecycleError::ScriptLaunchError {
                script: PathBuf::from(operation.as_ref()),
                source: io::Error::new(io::ErrorKind::NotFound, "fake launch failure"),
            });
        }

        let mut process = FakeProcess::exiting(0);
        match operation {
            Operation::Start => {
                state.running = true;
                state.countdown = None;
                if stdio.stdout == StreamMode::Piped {
                    process.stdout = Some(pipe(&state.stdout));
                }
                if stdio.stderr == StreamMode::Piped {
                    process.stderr = Some(pipe(&state.stderr));
                }
            }
            Operation::Stop => {
                if !state.ignore_stop && state.countdown.is_none() {
                    state.countdown = Some(state.polls_after_stop);
                }
            }
            Operation::Kill => {
                if state.countdown.is_none() {
                    state.countdown = Some(state.polls_after_stop);
                }
                process.delay = state.kill_delay;
            }
            Operation::Running => {
                match state.countdown {
                    Some(0) => {
                        state.running = false;
                        state.countdown = None;
                    }
                    Some(remaining) => state.countdown = Some(remaining - 1),
                    None => {}
                }
                process = FakeProcess::exiting(if state.running { 0 } else { 1 });
                process.interrupted = state.interrupt_running;
            }
        }

        Ok(Box::new(process))
    }
}

fn pipe(lines: &[String]) -> PipeReader {
    let mut data = String::new();
    for line in lines {
        data.push_str(line);
        data.push('\n');
    }
    Box::new(Cursor::new(data.into_bytes()))
}

struct FakeProcess {
    exit: ScriptExit,
    delay: Duration,
    interrupted: bool,
    stdout: Option<PipeReader>,
    stderr: Option<PipeReader>,
}

impl FakeProcess {
    fn exiting(code: i32) -> Self {
        Self {
            exit: ScriptExit { code: Some(code) },
            delay: Duration::ZERO,
            interrupted: false,
            stdout: None,
            stderr: None,
        }
    }
}

impl ScriptProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn wait(&mut self) -> Result<ScriptExit, WaitError> {
        if self.interrupted {
            return Err(WaitError::Interrupted);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(self.exit)
    }

    fn try_wait(&mut self) -> io::Result<Option<ScriptExit>> {
        if self.interrupted {
            return Ok(None);
        }
        Ok(Some(self.exit))
    }

    fn take_stdout(&mut self) -> Option<PipeReader> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<PipeReader> {
        self.stderr.take()
    }
}
