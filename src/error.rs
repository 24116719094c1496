//! Error handling for lifectl.
use std::path::PathBuf;

use thiserror::Error;

/// Defines all possible errors raised below the controller's public contract.
///
/// The transition methods on [`crate::lifecycle::ProcessLifecycle`] never surface
/// these to callers; they are logged and the next liveness poll decides state.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A `${VAR}` reference in the configuration has no value in the environment.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A duration field could not be parsed.
    #[error("Invalid duration '{0}'")]
    InvalidDuration(String),

    /// The configuration is structurally valid YAML but semantically unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A control script could not be spawned.
    #[error("Failed to launch control script '{script}': {source}")]
    ScriptLaunchError {
        /// Resolved path of the script that failed to launch.
        script: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Failure reported by a lifecycle listener.
///
/// Returned from listener callbacks; the registry logs it and moves on to the
/// next listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Free-form failure message.
    #[error("{0}")]
    Failed(String),

    /// I/O performed by the listener failed.
    #[error("listener I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&str> for ListenerError {
    fn from(message: &str) -> Self {
        ListenerError::Failed(message.to_string())
    }
}

impl From<String> for ListenerError {
    fn from(message: String) -> Self {
        ListenerError::Failed(message)
    }
}
