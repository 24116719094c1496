//! Launching control scripts as child processes.
//!
//! The controller only talks to [`ScriptInvoker`], so the spawn and signal
//! mechanism can be swapped per platform (or faked in tests) without touching
//! the start/stop/kill protocols.
use std::{
    io::{self, Read},
    process::{Child, Stdio},
};

use thiserror::Error;
use tracing::debug;

use crate::command::{ControlCommand, ScriptLayout};
use crate::error::LifecycleError;

/// How one standard stream of a script invocation is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Share the controller's own stream.
    #[default]
    Inherit,
    /// Capture the stream so a drain worker can read it.
    Piped,
}

impl StreamMode {
    fn stdio(self) -> Stdio {
        match self {
            StreamMode::Inherit => Stdio::inherit(),
            StreamMode::Piped => Stdio::piped(),
        }
    }
}

/// Standard I/O wiring for a script invocation. Stdin is always inherited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StdioPlan {
    pub stdout: StreamMode,
    pub stderr: StreamMode,
}

impl StdioPlan {
    /// Everything inherited from the controller.
    pub fn inherit() -> Self {
        Self::default()
    }
}

/// Exit status of a finished control script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptExit {
    /// Exit code, `None` when the script was terminated by a signal.
    pub code: Option<i32>,
}

impl ScriptExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ScriptExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Failure while waiting for a script to exit.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The wait was interrupted before the script's exit status was known.
    #[error("interrupted while waiting for control script")]
    Interrupted,
    /// Waiting failed outright.
    #[error("failed to wait for control script: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for WaitError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::Interrupted {
            WaitError::Interrupted
        } else {
            WaitError::Io(err)
        }
    }
}

/// Readable end of a captured pipe.
pub type PipeReader = Box<dyn Read + Send>;

/// Handle to a launched control script.
pub trait ScriptProcess: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Blocks until the script exits.
    fn wait(&mut self) -> Result<ScriptExit, WaitError>;

    /// Non-blocking exit status read; `Ok(None)` while the script still runs.
    fn try_wait(&mut self) -> io::Result<Option<ScriptExit>>;

    /// Takes ownership of the captured stdout pipe, if any.
    fn take_stdout(&mut self) -> Option<PipeReader>;

    /// Takes ownership of the captured stderr pipe, if any.
    fn take_stderr(&mut self) -> Option<PipeReader>;
}

/// Strategy that turns a [`ControlCommand`] into a running script.
pub trait ScriptInvoker: Send + Sync {
    fn launch(
        &self,
        command: &ControlCommand,
        stdio: StdioPlan,
    ) -> Result<Box<dyn ScriptProcess>, LifecycleError>;

    /// Human-readable description of `command` for logs.
    fn describe(&self, command: &ControlCommand) -> String {
        format!(
            "{} {}",
            command.operation(),
            command.args().join(" ")
        )
    }
}

/// Runs control scripts from the filesystem with `std::process`.
#[derive(Debug, Clone, Default)]
pub struct ShellScriptInvoker {
    layout: ScriptLayout,
}

impl ShellScriptInvoker {
    pub fn new(layout: ScriptLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ScriptLayout {
        &self.layout
    }
}

impl ScriptInvoker for ShellScriptInvoker {
    fn launch(
        &self,
        command: &ControlCommand,
        stdio: StdioPlan,
    ) -> Result<Box<dyn ScriptProcess>, LifecycleError> {
        let mut cmd = command.to_command(&self.layout);
        cmd.stdin(Stdio::inherit())
            .stdout(stdio.stdout.stdio())
            .stderr(stdio.stderr.stdio());

        debug!("Executing command: {cmd:?}");

        let child = cmd
            .spawn()
            .map_err(|source| LifecycleError::ScriptLaunchError {
                script: self.layout.script_path(command.operation()),
                source,
            })?;
        debug!(
            "Control script '{}' started with PID: {}",
            command.operation(),
            child.id()
        );
        Ok(Box::new(SystemProcess { child }))
    }

    fn describe(&self, command: &ControlCommand) -> String {
        command.display_line(&self.layout)
    }
}

/// [`ScriptProcess`] backed by a real OS child.
#[derive(Debug)]
pub struct SystemProcess {
    child: Child,
}

impl ScriptProcess for SystemProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn wait(&mut self) -> Result<ScriptExit, WaitError> {
        Ok(self.child.wait()?.into())
    }

    fn try_wait(&mut self) -> io::Result<Option<ScriptExit>> {
        Ok(self.child.try_wait()?.map(ScriptExit::from))
    }

    fn take_stdout(&mut self) -> Option<PipeReader> {
        self.child
            .stdout
            .take()
            .map(|out| Box::new(out) as PipeReader)
    }

    fn take_stderr(&mut self) -> Option<PipeReader> {
        self.child
            .stderr
            .take()
            .map(|err| Box::new(err) as PipeReader)
    }
}
