//! Configuration for supervised children.
use serde::{Deserialize, Deserializer};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

use crate::{
    constants::{DEFAULT_RESTART_DELAY, DEFAULT_SINGLETON_IDENTIFIER},
    error::{Result, TetherError},
};

/// Options shared by the parent and the child. Both sides must use identical
/// values, otherwise they derive different object names and never meet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SupervisionOptions {
    /// Re-spawn the child when it exits without being terminated through its handle.
    pub restart_on_exit: bool,
    /// Delay between an unexpected exit and the next spawn.
    #[serde(deserialize_with = "deserialize_duration")]
    pub restart_delay: Duration,
    /// Disambiguates unrelated deployments of the same executable.
    pub singleton_identifier: String,
    /// Children started from different executable paths do not collide.
    pub allow_multiple_from_different_paths: bool,
    /// Children of different users do not collide.
    pub allow_multiple_for_different_users: bool,
}

impl Default for SupervisionOptions {
    fn default() -> Self {
        Self {
            restart_on_exit: true,
            restart_delay: DEFAULT_RESTART_DELAY,
            singleton_identifier: DEFAULT_SINGLETON_IDENTIFIER.to_string(),
            allow_multiple_from_different_paths: true,
            allow_multiple_for_different_users: true,
        }
    }
}

/// Describes how to launch the child. Passed through to process creation unchanged
/// for every generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SpawnSpec {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory of the child.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Start the child in its own process group.
    #[serde(default)]
    pub new_process_group: bool,
    /// Detach the child from the parent's terminal streams.
    #[serde(default)]
    pub hidden: bool,
}

impl SpawnSpec {
    /// Creates a spec that runs `program` without arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Builds the command for one generation.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env);

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        if self.hidden {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }

        #[cfg(unix)]
        if self.new_process_group {
            command.process_group(0);
        }

        command
    }
}

/// File layout accepted by [`load_config`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChildConfig {
    /// Supervision options.
    #[serde(default)]
    pub options: SupervisionOptions,
    /// The child to launch.
    pub child: SpawnSpec,
    /// How long to wait for the child to register.
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub startup_timeout: Option<Duration>,
    /// Grace period given to the child when the parent shuts down.
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub stop_timeout: Option<Duration>,
}

/// Loads and parses a YAML child configuration.
///
/// A relative `working_dir` is resolved against the directory holding the file.
pub fn load_config(config_path: &Path) -> Result<ChildConfig> {
    let content = fs::read_to_string(config_path).map_err(|e| {
        TetherError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let mut config: ChildConfig =
        serde_yaml::from_str(&content).map_err(TetherError::ConfigParseError)?;

    let base_path = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    if let Some(dir) = config.child.working_dir.as_ref()
        && dir.is_relative()
    {
        config.child.working_dir = Some(base_path.join(dir));
    }

    Ok(config)
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
/// A bare number is read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(TetherError::InvalidDuration(raw.to_string()));
    }

    let (amount_str, unit_millis) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1_000)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60_000)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3_600_000)
    } else {
        (value, 1_000)
    };

    let amount: u64 = amount_str
        .parse()
        .map_err(|_| TetherError::InvalidDuration(raw.to_string()))?;

    Ok(Duration::from_millis(amount.saturating_mul(unit_millis)))
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| parse_duration(&raw).map_err(serde::de::Error::custom))
        .transpose()
}
