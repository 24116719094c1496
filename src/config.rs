//! Configuration management for lifectl.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
    time::Duration,
};
use tracing::warn;

use crate::{
    command::{ProcessTag, ScriptLayout, resolve_prefix},
    drain::OutputSink,
    error::LifecycleError,
    lifecycle::{
        Capture, DEFAULT_CONFIRM_INTERVAL, ProcessLifecycle, StopTimeout,
        UnconfirmedLiveness,
    },
};

/// Default configuration file names, tried in order.
pub const DEFAULT_CONFIG_FILES: [&str; 2] = ["lifectl.yaml", "lifectl.yml"];

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("valid env var pattern")
});

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// The controlled process.
    pub process: ProcessConfig,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub project_dir: Option<PathBuf>,
}

/// Configuration for the controlled process.
#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    /// Tag passed to every control script.
    pub tag: String,
    /// Where the control scripts live.
    #[serde(default)]
    pub scripts: ScriptsConfig,
    /// Arguments passed to the `start` script after the tag.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment for the `start` script.
    pub env: Option<EnvConfig>,
    /// Time before the stop loop escalates to `kill`; negative or `never` disables it.
    pub stop_timeout: Option<DurationValue>,
    /// Pause between liveness polls while stopping or killing.
    pub confirm_interval: Option<DurationValue>,
    /// Which streams are drained when output is followed.
    #[serde(default)]
    pub capture: Capture,
    /// Answer to give when the `running` script's exit status cannot be read.
    #[serde(default)]
    pub interrupted_wait: UnconfirmedLiveness,
}

/// Location of the control scripts.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ScriptsConfig {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    pub working_dir: Option<String>,
}

/// Represents environment variables for the start script.
#[derive(Debug, Deserialize, Clone)]
pub struct EnvConfig {
    /// Optional path to an environment file.
    pub file: Option<String>,
    /// Key-value pairs of environment variables.
    pub vars: Option<HashMap<String, String>>,
}

impl EnvConfig {
    /// Resolves the full path to the env file based on a base directory.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| {
            let path = Path::new(f);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
    }
}

/// A duration written either as a number of seconds or a string with a unit.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(i64),
    Text(String),
}

impl DurationValue {
    /// Interprets the value as a stop timeout; negative or `never` means never.
    pub fn stop_timeout(&self) -> Result<StopTimeout, LifecycleError> {
        match self {
            DurationValue::Seconds(secs) if *secs < 0 => Ok(StopTimeout::Never),
            DurationValue::Seconds(secs) => {
                Ok(StopTimeout::After(Duration::from_secs(*secs as u64)))
            }
            DurationValue::Text(raw) => {
                let trimmed = raw.trim();
                if trimmed.eq_ignore_ascii_case("never") || trimmed.starts_with('-') {
                    Ok(StopTimeout::Never)
                } else {
                    parse_duration(trimmed).map(StopTimeout::After)
                }
            }
        }
    }

    pub fn duration(&self) -> Result<Duration, LifecycleError> {
        match self {
            DurationValue::Seconds(secs) if *secs >= 0 => {
                Ok(Duration::from_secs(*secs as u64))
            }
            DurationValue::Seconds(secs) => {
                Err(LifecycleError::InvalidDuration(secs.to_string()))
            }
            DurationValue::Text(raw) => parse_duration(raw),
        }
    }
}

/// Parses `500ms`, `30s`, `2m`, `1h` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, LifecycleError> {
    let trimmed = raw.trim();
    let invalid = || LifecycleError::InvalidDuration(raw.to_string());

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: u64 = number.parse().map_err(|_| invalid())?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.checked_mul(60).ok_or_else(invalid)?)),
        "h" => Ok(Duration::from_secs(value.checked_mul(3600).ok_or_else(invalid)?)),
        _ => Err(invalid()),
    }
}

/// Expands `$VAR` and `${VAR}` references, looking in `overrides` before the
/// process environment.
fn expand_env_vars(
    input: &str,
    overrides: &BTreeMap<String, String>,
) -> Result<String, LifecycleError> {
    let mut missing = None;
    let result = ENV_VAR_PATTERN.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        if let Some(value) = overrides.get(var_name) {
            return value.clone();
        }
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                if missing.is_none() {
                    missing = Some(var_name.to_string());
                }
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(LifecycleError::MissingEnvVar(var_name)),
        None => Ok(result.to_string()),
    }
}

/// Reads a `.env` style file into a map.
fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>, LifecycleError> {
    let content = fs::read_to_string(path).map_err(|e| {
        LifecycleError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;

    let mut vars = BTreeMap::new();
    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().to_string();
            let mut value = value.trim();

            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }

            vars.insert(key, value.to_string());
        } else {
            warn!("Ignoring malformed line in env file {}: {}", path.display(), line);
        }
    }
    Ok(vars)
}

/// Finds the config file to use when none was given explicitly.
pub fn resolve_config_path(config_path: Option<&str>) -> PathBuf {
    if let Some(path) = config_path {
        return PathBuf::from(path);
    }
    DEFAULT_CONFIG_FILES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILES[0]))
}

/// Loads and parses the configuration file, expanding environment variables.
///
/// Variables defined in the process's env file are visible to expansion, ahead
/// of the controller's own environment.
pub fn load_config(config_path: Option<&str>) -> Result<Config, LifecycleError> {
    let config_path = resolve_config_path(config_path);

    let content = fs::read_to_string(&config_path).map_err(|e| {
        LifecycleError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let base_path = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let raw: Config = serde_yaml::from_str(&content)?;
    let file_vars = match raw.process.env.as_ref().and_then(|env| env.path(&base_path)) {
        Some(path) => load_env_file(&path)?,
        None => BTreeMap::new(),
    };

    let expanded_content = expand_env_vars(&content, &file_vars)?;
    let mut config: Config = serde_yaml::from_str(&expanded_content)?;

    if config.process.tag.trim().is_empty() {
        return Err(LifecycleError::InvalidConfig(
            "process.tag must not be empty".into(),
        ));
    }

    config.project_dir = Some(base_path);
    Ok(config)
}

impl Config {
    fn base_dir(&self) -> PathBuf {
        self.project_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Merged start environment: env file first, inline `vars` win.
    pub fn start_environment(&self) -> Result<BTreeMap<String, String>, LifecycleError> {
        let mut resolved = BTreeMap::new();
        if let Some(env_config) = &self.process.env {
            if let Some(path) = env_config.path(&self.base_dir()) {
                resolved.extend(load_env_file(&path)?);
            }
            if let Some(vars) = &env_config.vars {
                for (key, value) in vars {
                    resolved.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(resolved)
    }

    /// Script layout with relative paths resolved against the config directory.
    pub fn script_layout(&self) -> ScriptLayout {
        let base = self.base_dir();
        let scripts = &self.process.scripts;
        let layout = ScriptLayout::new(resolve_prefix(&scripts.prefix, &base), &scripts.suffix);
        match scripts.working_dir.as_deref() {
            Some(dir) if Path::new(dir).is_absolute() => layout.with_working_dir(dir),
            Some(dir) => layout.with_working_dir(base.join(dir)),
            None => layout,
        }
    }

    /// Builds a controller for the configured process.
    pub fn build_lifecycle(
        &self,
        sink: Option<Arc<dyn OutputSink>>,
    ) -> Result<ProcessLifecycle, LifecycleError> {
        let process = &self.process;
        let stop_timeout = match &process.stop_timeout {
            Some(value) => value.stop_timeout()?,
            None => StopTimeout::Never,
        };
        let confirm_interval = match &process.confirm_interval {
            Some(value) => value.duration()?,
            None => DEFAULT_CONFIRM_INTERVAL,
        };

        let mut builder = ProcessLifecycle::builder(ProcessTag::new(process.tag.clone()))
            .layout(self.script_layout())
            .command(process.command.iter().cloned())
            .envs(self.start_environment()?)
            .stop_timeout(stop_timeout)
            .confirm_interval(confirm_interval)
            .unconfirmed_liveness(process.interrupted_wait)
            .capture(process.capture);
        if let Some(sink) = sink {
            builder = builder.sink(sink);
        }
        Ok(builder.build())
    }
}
