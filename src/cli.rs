//! Command-line interface for tether.
use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{
    config::{ChildConfig, SpawnSpec, SupervisionOptions, load_config, parse_duration},
    error::{Result, TetherError},
};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };

        Ok(LogLevelArg(level))
    }
}

fn duration_arg(raw: &str) -> std::result::Result<Duration, String> {
    parse_duration(raw).map_err(|err| err.to_string())
}

/// Command-line interface for tether.
#[derive(Parser, Debug)]
#[command(name = "tether", version, author)]
#[command(about = "Keeps exactly one supervised child alive per identity", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Flags that decide which names an identity maps to. Parent and child must agree.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityArgs {
    /// Disambiguates unrelated deployments of the same executable.
    #[arg(long, value_name = "ID")]
    pub identifier: Option<String>,

    /// Let copies of the executable at different paths collide.
    #[arg(long)]
    pub shared_paths: bool,

    /// Let instances of different users collide.
    #[arg(long)]
    pub shared_users: bool,
}

impl IdentityArgs {
    /// Writes the flags into `options`.
    pub fn apply(&self, options: &mut SupervisionOptions) {
        if let Some(identifier) = &self.identifier {
            options.singleton_identifier = identifier.clone();
        }
        if self.shared_paths {
            options.allow_multiple_from_different_paths = false;
        }
        if self.shared_users {
            options.allow_multiple_for_different_users = false;
        }
    }

    /// Default options with the flags applied.
    pub fn options(&self) -> SupervisionOptions {
        let mut options = SupervisionOptions::default();
        self.apply(&mut options);
        options
    }
}

/// Arguments of `tether run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// YAML file describing the child and its options.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Delay before a crashed child is started again (e.g. "500ms", "5s").
    #[arg(long, value_name = "DURATION", value_parser = duration_arg)]
    pub restart_delay: Option<Duration>,

    /// Do not restart the child when it exits.
    #[arg(long)]
    pub no_restart: bool,

    /// How long the child may take to register before it is killed.
    #[arg(long, value_name = "DURATION", value_parser = duration_arg)]
    pub startup_timeout: Option<Duration>,

    /// Grace period given to the child on shutdown before it is killed.
    #[arg(long, value_name = "DURATION", value_parser = duration_arg)]
    pub stop_timeout: Option<Duration>,

    /// Start the child in its own process group.
    #[arg(long)]
    pub new_process_group: bool,

    /// Program and arguments to supervise. Overrides the config file.
    #[arg(last = true, value_name = "PROGRAM")]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Merges the config file, if any, with the command-line overrides.
    pub fn into_config(self) -> Result<ChildConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ChildConfig {
                options: SupervisionOptions::default(),
                child: SpawnSpec::default(),
                startup_timeout: None,
                stop_timeout: None,
            },
        };

        if let Some((program, args)) = self.command.split_first() {
            config.child.program = PathBuf::from(program);
            config.child.args = args.to_vec();
        }
        if config.child.program.as_os_str().is_empty() {
            return Err(TetherError::MissingProgram);
        }

        self.identity.apply(&mut config.options);
        if self.no_restart {
            config.options.restart_on_exit = false;
        }
        if let Some(delay) = self.restart_delay {
            config.options.restart_delay = delay;
        }
        if self.startup_timeout.is_some() {
            config.startup_timeout = self.startup_timeout;
        }
        if self.stop_timeout.is_some() {
            config.stop_timeout = self.stop_timeout;
        }
        if self.new_process_group {
            config.child.new_process_group = true;
        }

        Ok(config)
    }
}

/// Arguments of `tether child`.
#[derive(Args, Debug, Clone)]
pub struct ChildArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Append the pid of this process to FILE once registered.
    #[arg(long, value_name = "FILE")]
    pub pid_file: Option<PathBuf>,

    /// Write the reason for shutting down to FILE.
    #[arg(long, value_name = "FILE")]
    pub exit_file: Option<PathBuf>,

    /// Keep running this long after the exit notification.
    #[arg(long, value_name = "DURATION", value_parser = duration_arg)]
    pub linger: Option<Duration>,
}

/// Available commands for tether.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a singleton child and keep it running until interrupted.
    Run(RunArgs),

    /// Run as a supervised child: register, then wait for the exit notification.
    Child(ChildArgs),

    /// Report whether an instance of PROGRAM is running.
    Probe {
        /// Program whose identity is probed.
        program: PathBuf,

        #[command(flatten)]
        identity: IdentityArgs,
    },

    /// Print the names derived for PROGRAM.
    Names {
        /// Program whose names are printed.
        program: PathBuf,

        #[command(flatten)]
        identity: IdentityArgs,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
