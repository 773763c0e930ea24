//! Child side: registration with the parent and the exit watchdog.
use std::sync::Arc;

use nix::unistd::{Pid, getppid};
use strum_macros::{AsRefStr, Display};
use sysinfo::{ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::SignalChannel,
    config::SupervisionOptions,
    constants::WATCHDOG_POLL_INTERVAL,
    error::Result,
    gate::{Claim, SingletonGate},
    named::{NamedObjects, default_objects},
    naming::NamedHandleSet,
};

/// Why [`ChildWatchdog::wait_for_exit_notification`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ExitReason {
    /// The caller's cancellation token fired.
    Cancelled,
    /// The parent set the termination signal.
    TerminationRequested,
    /// The parent process is gone.
    ParentExited,
    /// No live parent process could be resolved; the watchdog never armed.
    NoParent,
    /// The watchdog hit an internal error and gave up.
    Fault,
}

/// Child-side half of the protocol.
#[derive(Debug, Clone)]
pub struct ChildWatchdog {
    objects: Arc<dyn NamedObjects>,
}

impl Default for ChildWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildWatchdog {
    /// Watchdog over the runtime directories of the environment.
    pub fn new() -> Self {
        Self::with_objects(default_objects())
    }

    /// Watchdog over a custom named-object backend.
    pub fn with_objects(objects: Arc<dyn NamedObjects>) -> Self {
        Self { objects }
    }

    /// Claims the singleton lock of the running executable and tells the waiting
    /// parent that startup finished.
    ///
    /// Returns `false` when another instance owns the lock, when no parent is
    /// waiting for this identity, or on any error. A standalone instance keeps the
    /// lock it claimed.
    pub fn register_as_child(&self, options: &SupervisionOptions) -> bool {
        let registered = NamedHandleSet::for_current_exe(options)
            .and_then(|names| self.register_with_names(&names));
        match registered {
            Ok(registered) => registered,
            Err(err) => {
                warn!("Failed to register as child process: {err}");
                false
            }
        }
    }

    /// [`ChildWatchdog::register_as_child`] for explicit names.
    pub fn register_with_names(&self, names: &NamedHandleSet) -> Result<bool> {
        let gate = SingletonGate::new(Arc::clone(&self.objects));
        if gate.claim(&names.singleton)? == Claim::Contended {
            warn!("Singleton {} is owned by another instance", names.singleton);
            return Ok(false);
        }

        let channel = SignalChannel::new(Arc::clone(&self.objects), names.clone());
        let Some(startup) = channel.open_startup()? else {
            debug!("No parent is waiting on {}", names.startup);
            return Ok(false);
        };
        startup.set()?;
        info!("Registered as child process {}", std::process::id());
        Ok(true)
    }

    /// Resolves once this process should shut down: termination was requested, the
    /// parent died, or `cancel` fired. Never fails; faults end the wait as
    /// [`ExitReason::Fault`].
    pub async fn wait_for_exit_notification(
        &self,
        options: &SupervisionOptions,
        cancel: &CancellationToken,
    ) -> ExitReason {
        match NamedHandleSet::for_current_exe(options) {
            Ok(names) => self.wait_with_names(&names, cancel).await,
            Err(err) => {
                debug!("Watchdog could not derive its names: {err}");
                ExitReason::Fault
            }
        }
    }

    /// [`ChildWatchdog::wait_for_exit_notification`] for explicit names.
    pub async fn wait_with_names(
        &self,
        names: &NamedHandleSet,
        cancel: &CancellationToken,
    ) -> ExitReason {
        let Some(parent) = resolve_parent() else {
            debug!("No parent process; watchdog disabled");
            return ExitReason::NoParent;
        };

        let channel = SignalChannel::new(Arc::clone(&self.objects), names.clone());
        let terminate = match channel.open_terminate() {
            Ok(Some(signal)) => Some(signal),
            Ok(None) => {
                debug!(
                    "No termination signal {}; watching parent process {parent} only",
                    names.terminate
                );
                None
            }
            Err(err) => {
                debug!("Watchdog failed to open {}: {err}", names.terminate);
                return ExitReason::Fault;
            }
        };
        debug!("Watching parent process {parent} and {}", names.terminate);

        loop {
            if cancel.is_cancelled() {
                return ExitReason::Cancelled;
            }

            match terminate.as_ref().map(|signal| signal.poll_once()) {
                Some(Ok(true)) => {
                    info!("Termination requested by parent process {parent}");
                    return ExitReason::TerminationRequested;
                }
                Some(Ok(false)) | None => {}
                Some(Err(err)) => {
                    debug!("Watchdog failed to poll {}: {err}", names.terminate);
                    return ExitReason::Fault;
                }
            }

            if getppid() != parent {
                info!("Parent process {parent} exited");
                return ExitReason::ParentExited;
            }

            tokio::select! {
                _ = cancel.cancelled() => return ExitReason::Cancelled,
                _ = tokio::time::sleep(WATCHDOG_POLL_INTERVAL) => {}
            }
        }
    }
}

/// The parent process, if there is a live one other than init.
fn resolve_parent() -> Option<Pid> {
    let ppid = getppid();
    if ppid.as_raw() <= 1 {
        return None;
    }

    let pid = sysinfo::Pid::from_u32(ppid.as_raw() as u32);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|_| ppid)
}
