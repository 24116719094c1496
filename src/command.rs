//! Assembly of control script invocations.
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    process::Command,
};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Operation a control script implements.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    /// Spawn and detach the controlled process.
    Start,
    /// Ask the controlled process to shut down gracefully.
    Stop,
    /// Forcefully terminate the controlled process.
    Kill,
    /// Exit 0 iff the controlled process is alive.
    Running,
}

/// Opaque identifier handed to every control script to select the process instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessTag(String);

impl ProcessTag {
    /// Wraps an identifier.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Returns the tag as passed on the command line.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProcessTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Locates control scripts as `<prefix><operation><suffix>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptLayout {
    /// Prepended to the operation name, usually a directory path.
    pub prefix: String,
    /// Appended to the operation name, e.g. `.sh`.
    pub suffix: String,
    /// Working directory for every script invocation.
    pub working_dir: Option<PathBuf>,
}

impl ScriptLayout {
    /// Creates a layout without a working directory override.
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
            working_dir: None,
        }
    }

    /// Sets the working directory used for script invocations.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Path of the script implementing `operation`.
    pub fn script_path(&self, operation: Operation) -> PathBuf {
        PathBuf::from(format!(
            "{}{}{}",
            self.prefix,
            operation.as_ref(),
            self.suffix
        ))
    }
}

/// One control script invocation. Built fresh for each call and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    operation: Operation,
    tag: ProcessTag,
    extra_args: Vec<String>,
    environment: BTreeMap<String, String>,
}

impl ControlCommand {
    /// `start` receives the full launch arguments and environment.
    pub fn start(
        tag: &ProcessTag,
        extra_args: &[String],
        environment: &BTreeMap<String, String>,
    ) -> Self {
        Self {
            operation: Operation::Start,
            tag: tag.clone(),
            extra_args: extra_args.to_vec(),
            environment: environment.clone(),
        }
    }

    /// `stop`, `kill` and `running` receive only the tag.
    pub fn tag_only(operation: Operation, tag: &ProcessTag) -> Self {
        Self {
            operation,
            tag: tag.clone(),
            extra_args: Vec::new(),
            environment: BTreeMap::new(),
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn tag(&self) -> &ProcessTag {
        &self.tag
    }

    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Argument vector after the script path: the tag followed by the extra args.
    pub fn args(&self) -> Vec<&str> {
        std::iter::once(self.tag.as_str())
            .chain(self.extra_args.iter().map(String::as_str))
            .collect()
    }

    /// Builds the OS command for this invocation. Standard I/O is left to the caller.
    pub fn to_command(&self, layout: &ScriptLayout) -> Command {
        let mut cmd = Command::new(layout.script_path(self.operation));
        cmd.args(self.args());
        cmd.envs(&self.environment);
        if let Some(dir) = layout.working_dir.as_deref() {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Human-readable `script tag args...` line for logs.
    pub fn display_line(&self, layout: &ScriptLayout) -> String {
        let script = layout.script_path(self.operation);
        let mut line = script.display().to_string();
        for arg in self.args() {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Resolves a relative script prefix against `base`, leaving absolute ones alone.
pub(crate) fn resolve_prefix(prefix: &str, base: &Path) -> String {
    if prefix.is_empty() || Path::new(prefix).is_absolute() {
        return prefix.to_string();
    }
    let joined = base.join(prefix);
    let mut resolved = joined.to_string_lossy().to_string();
    // `Path::join` drops the trailing separator that turns the prefix into a directory.
    if prefix.ends_with('/') && !resolved.ends_with('/') {
        resolved.push('/');
    }
    resolved
}
