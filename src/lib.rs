//! Tether keeps exactly one supervised child process alive per identity. A parent
//! starts the child through [`supervisor::ChildSupervisor`], the child registers
//! itself through [`watchdog::ChildWatchdog`], and the two sides coordinate only
//! through host-wide named locks and signals derived from the child's executable
//! path, user and a configurable identifier.

/// Startup and termination signals of one identity.
pub mod channel;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared constants.
pub mod constants;

/// Error handling.
pub mod error;

/// Singleton lock probing and claiming.
pub mod gate;

/// Named cross-process locks and signals.
pub mod named;

/// Derivation of object names.
pub mod naming;

/// Handle to a supervised child.
pub mod process;

/// Directories backing the named-object namespaces.
pub mod runtime;

/// Parent side: singleton start and restart supervision.
pub mod supervisor;

/// Child side: registration and exit watchdog.
pub mod watchdog;

#[cfg(test)]
mod test_utils;
