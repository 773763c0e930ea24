//! Error handling for tether.
use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Defines all errors surfaced by the supervisor, the watchdog and the configuration layer.
#[derive(Debug, Error)]
pub enum TetherError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A duration string could not be parsed.
    #[error("Invalid duration value: '{0}'")]
    InvalidDuration(String),

    /// Neither the command line nor the config file names a program to run.
    #[error("No program to supervise; pass one after `--` or set `child.program` in the config")]
    MissingProgram,

    /// The executable of a child could not be resolved to an absolute path.
    #[error("Failed to resolve executable '{}': {source}", path.display())]
    ExecutableResolveError {
        /// The program as given by the caller.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The OS refused to create the child process.
    #[error("Failed to start child process '{}': {source}", program.display())]
    SpawnError {
        /// Program that failed to start.
        program: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The child did not register within the allotted time and was killed.
    #[error(
        "Child process '{}' failed to register as child process within {timeout:?}",
        program.display()
    )]
    StartupTimeout {
        /// Program that failed to register.
        program: PathBuf,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The child exited before it registered.
    #[error(
        "Child process '{}' exited before registering as child process (code {code:?})",
        program.display()
    )]
    StartupExited {
        /// Program that exited.
        program: PathBuf,
        /// Its exit code, `None` when killed by a signal.
        code: Option<i32>,
    },

    /// The handle was disposed while a restarted child was still starting.
    #[error(
        "Startup of child process '{}' abandoned because its handle was disposed",
        program.display()
    )]
    StartupAbandoned {
        /// Program whose startup was abandoned.
        program: PathBuf,
    },

    /// Error signalling or reaping a supervised process.
    #[error("Failed to terminate child process {pid}: {source}")]
    TerminateError {
        /// PID of the process being terminated.
        pid: u32,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error from the named object backend.
    #[error("Named object error: {0}")]
    NamedObject(#[from] NamedObjectError),
}

/// Error type for named lock and signal operations.
#[derive(Debug, Error)]
pub enum NamedObjectError {
    /// The namespace directory could not be prepared.
    #[error("Failed to prepare namespace directory {}: {source}", dir.display())]
    Namespace {
        /// Directory backing the namespace.
        dir: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// I/O on the file backing a named object failed.
    #[error("Named object '{name}' is unavailable: {source}")]
    Io {
        /// Display form of the object name.
        name: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The file backing a signal holds something other than a state byte.
    #[error("Named signal '{name}' holds an invalid state byte {byte:#04x}")]
    CorruptSignal {
        /// Display form of the object name.
        name: String,
        /// The offending byte.
        byte: u8,
    },
}

/// Result alias used across the crate.
pub type Result<T, E = TetherError> = std::result::Result<T, E>;
