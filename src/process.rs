//! Handle to a supervised child that survives restarts.
//!
//! The caller keeps one [`ChildProcess`] for the lifetime of the identity. The
//! supervising thread swaps the process of a new generation into the shared state;
//! every read and write of that state goes through one mutex.
use std::{
    collections::{HashMap, VecDeque},
    io,
    os::unix::process::ExitStatusExt,
    process::{Child, ExitStatus},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill, killpg},
    unistd::{Pid, getpgid, getpgrp},
};
use strum_macros::{AsRefStr, Display};
use sysinfo::{ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    constants::{DROP_STOP_TIMEOUT, EXIT_POLL_INTERVAL},
    error::{Result, TetherError},
    named::NamedSignal,
};

/// Lifecycle of a supervised identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ChildState {
    /// A generation is being spawned and has not registered yet.
    Starting,
    /// The current generation registered and has not been seen exiting.
    Running,
    /// The current generation exited unexpectedly; a restart is scheduled.
    RestartPending,
    /// Termination was requested or supervision ended.
    Disposed,
}

/// How one generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRecord {
    /// PID of the generation.
    pub pid: u32,
    /// Generation number, starting at 1.
    pub generation: u64,
    /// Exit code if the process exited normally.
    pub code: Option<i32>,
    /// Signal number if the process was killed by a signal.
    pub signal: Option<i32>,
    /// When the exit was observed.
    pub observed_at: DateTime<Utc>,
}

/// One spawned process together with its binding to the termination signal.
pub(crate) struct Generation {
    pub(crate) child: Child,
    pub(crate) terminate: Box<dyn NamedSignal>,
}

pub(crate) struct HandleState {
    pub(crate) state: ChildState,
    pub(crate) disposed: bool,
    /// A replacement generation is being spawned by the supervising thread.
    pub(crate) spawning: bool,
    /// PID of that replacement while it has not registered and is not reaped.
    pub(crate) starting_pid: Option<u32>,
    child: Child,
    pid: u32,
    generation: u64,
    terminate: Option<Box<dyn NamedSignal>>,
    exit: Option<ExitStatus>,
    last_exit: Option<ExitRecord>,
    pub(crate) last_error: Option<String>,
}

impl HandleState {
    /// Reaps the current generation if it has exited. Safe to call repeatedly.
    pub(crate) fn poll_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.exit {
            return Ok(Some(status));
        }

        let status = self.child.try_wait()?;
        if let Some(status) = status {
            debug!(
                "Child process {} (generation {}) exited with {status:?}",
                self.pid, self.generation
            );
            self.exit = Some(status);
            self.last_exit = Some(ExitRecord {
                pid: self.pid,
                generation: self.generation,
                code: status.code(),
                signal: status.signal(),
                observed_at: Utc::now(),
            });
        }
        Ok(status)
    }

    /// Makes `next` the current generation. When the handle was disposed while
    /// `next` was starting, its termination signal is fired right away.
    pub(crate) fn install(&mut self, next: Generation) {
        self.pid = next.child.id();
        self.child = next.child;
        self.exit = None;
        self.generation += 1;
        if self.disposed {
            release_terminate_signal(self.pid, Some(next.terminate));
        } else {
            self.terminate = Some(next.terminate);
            self.state = ChildState::Running;
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Starts disposal. Returns the termination signal to fire, or `None` when
    /// disposal already began earlier.
    fn begin_dispose(&mut self) -> Option<Option<Box<dyn NamedSignal>>> {
        if self.disposed {
            return None;
        }
        self.disposed = true;
        self.state = ChildState::Disposed;
        Some(self.terminate.take())
    }

    /// Ends supervision without a termination request. The termination signal is
    /// released unset because another instance may be bound to the same name.
    pub(crate) fn end_supervision(&mut self, error: Option<String>) {
        self.disposed = true;
        self.state = ChildState::Disposed;
        self.terminate = None;
        if error.is_some() {
            self.last_error = error;
        }
    }

    /// Kills the current generation and its descendants, then reaps it.
    fn kill_and_reap(&mut self) -> Result<()> {
        if self.poll_exit().map_err(|source| self.terminate_error(source))?.is_some() {
            return Ok(());
        }

        kill_process_tree(self.pid).map_err(|source| self.terminate_error(source))?;
        let status = self
            .child
            .wait()
            .map_err(|source| self.terminate_error(source))?;
        debug!("Child process {} reaped after kill: {status:?}", self.pid);
        self.poll_exit().map_err(|source| self.terminate_error(source))?;
        Ok(())
    }

    fn terminate_error(&self, source: io::Error) -> TetherError {
        TetherError::TerminateError {
            pid: self.pid,
            source,
        }
    }
}

pub(crate) struct Shared {
    state: Mutex<HandleState>,
    pub(crate) changed: Condvar,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits until the current generation has exited and no replacement is being
    /// spawned. `None` waits forever. Returns whether that point was reached.
    pub(crate) fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            {
                let mut state = self.lock();
                let exited = state
                    .poll_exit()
                    .map_err(|source| state.terminate_error(source))?
                    .is_some();
                if exited && !state.spawning {
                    return Ok(true);
                }
            }

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Ok(false);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Disposes the handle: fires the termination signal, waits up to `grace`
    /// (forever when `None`) and force-kills on expiry. No-op once disposed.
    pub(crate) fn shutdown(&self, grace: Option<Duration>) -> Result<()> {
        let Some(pid) = self.begin_dispose() else {
            return Ok(());
        };

        if self.wait_for_exit(grace)? {
            info!("Child process {pid} exited after termination request");
            return Ok(());
        }

        warn!(
            "Child process {pid} did not exit within {:?}; killing process tree",
            grace.unwrap_or_default()
        );
        self.force_stop()
    }

    /// Marks the handle disposed and fires the termination signal. Returns the pid
    /// of the current generation, or `None` when disposal already began earlier.
    pub(crate) fn begin_dispose(&self) -> Option<u32> {
        let (pid, signal) = {
            let mut state = self.lock();
            let signal = state.begin_dispose()?;
            (state.pid, signal)
        };
        self.changed.notify_all();
        release_terminate_signal(pid, signal);
        Some(pid)
    }

    /// Kills the current generation and a replacement that is still starting, then
    /// waits until the supervising thread has let go of the replacement.
    pub(crate) fn force_stop(&self) -> Result<()> {
        loop {
            {
                let mut state = self.lock();
                if let Some(starting) = state.starting_pid {
                    debug!("Killing generation {starting} that is still starting");
                    if let Err(err) = kill_process_tree(starting) {
                        warn!("Failed to kill child process {starting}: {err}");
                    }
                }
                state.kill_and_reap()?;
                if !state.spawning {
                    return Ok(());
                }
            }
            self.wait_for_exit(Some(EXIT_POLL_INTERVAL))?;
        }
    }
}

fn release_terminate_signal(pid: u32, signal: Option<Box<dyn NamedSignal>>) {
    let Some(signal) = signal else {
        return;
    };
    if let Err(err) = signal.set() {
        warn!("Failed to signal termination to child process {pid}: {err}");
    }
    if let Err(err) = signal.remove() {
        debug!("Failed to remove termination signal {}: {err}", signal.name());
    }
}

/// Handle to a supervised child. Stays valid across restarts.
///
/// Dropping a handle that was not disposed yet terminates it, which blocks for up
/// to [`DROP_STOP_TIMEOUT`] before the process tree is killed.
pub struct ChildProcess {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ChildProcess")
            .field("pid", &state.pid)
            .field("generation", &state.generation)
            .field("state", &state.state)
            .finish()
    }
}

impl ChildProcess {
    pub(crate) fn new(first: Generation) -> Self {
        let pid = first.child.id();
        let state = HandleState {
            state: ChildState::Running,
            disposed: false,
            spawning: false,
            starting_pid: None,
            child: first.child,
            pid,
            generation: 1,
            terminate: Some(first.terminate),
            exit: None,
            last_exit: None,
            last_error: None,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                changed: Condvar::new(),
            }),
        }
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// PID of the current generation.
    pub fn pid(&self) -> u32 {
        self.shared.lock().pid
    }

    /// Number of the current generation, starting at 1.
    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChildState {
        self.shared.lock().state
    }

    /// True once any termination path has begun. Never reverts.
    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }

    /// The most recent exit observed for any generation.
    pub fn last_exit(&self) -> Option<ExitRecord> {
        self.shared.lock().last_exit.clone()
    }

    /// Why supervision ended, if a restart attempt failed.
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Whether the current generation has exited and no replacement is starting.
    pub fn has_exited(&self) -> Result<bool> {
        self.exited_without_replacement()
    }

    /// Requests termination and force-kills the process tree if the child has not
    /// exited within `timeout`. Idempotent.
    pub fn terminate(&self, timeout: Duration) -> Result<()> {
        self.shared.shutdown(Some(timeout))
    }

    /// Requests termination and waits for the child to exit, however long it takes.
    /// Never force-kills a registered generation; a restarted one that has not
    /// registered yet is abandoned and killed. Idempotent.
    pub fn dispose(&self) -> Result<()> {
        self.shared.shutdown(None)
    }

    /// Requests termination and waits for the exit without blocking the runtime.
    /// If `cancel` fires first, the process tree is killed.
    pub async fn terminate_async(&self, cancel: CancellationToken) -> Result<()> {
        let Some(pid) = self.shared.begin_dispose() else {
            return Ok(());
        };

        loop {
            if self.exited_without_replacement()? {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Termination of child process {pid} cancelled; killing process tree");
                    return self.shared.force_stop();
                }
                _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {}
            }
        }
    }

    /// Async form of [`ChildProcess::dispose`].
    pub async fn dispose_async(&self) -> Result<()> {
        if self.shared.begin_dispose().is_none() {
            return Ok(());
        }

        while !self.exited_without_replacement()? {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        Ok(())
    }

    fn exited_without_replacement(&self) -> Result<bool> {
        let mut state = self.shared.lock();
        let exited = state
            .poll_exit()
            .map_err(|source| state.terminate_error(source))?
            .is_some();
        Ok(exited && !state.spawning)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.is_disposed() {
            return;
        }
        if let Err(err) = self.terminate(DROP_STOP_TIMEOUT) {
            warn!("Failed to terminate child process on drop: {err}");
        }
    }
}

/// Sends SIGKILL to `pid`, its process group when it leads its own, and every
/// descendant found in the process table. Descendants go first, deepest first.
pub fn kill_process_tree(pid: u32) -> io::Result<()> {
    let root = Pid::from_raw(pid as i32);
    let descendants = collect_descendants(pid);

    if let Ok(pgid) = getpgid(Some(root))
        && pgid == root
        && pgid != getpgrp()
    {
        ignore_missing(killpg(pgid, Signal::SIGKILL))?;
    }

    for child in descendants.iter().rev() {
        ignore_missing(kill(Pid::from_raw(*child as i32), Signal::SIGKILL))?;
    }

    ignore_missing(kill(root, Signal::SIGKILL))
}

fn collect_descendants(pid: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (child_pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(child_pid.as_u32());
        }
    }

    let mut ordered = Vec::new();
    let mut queue = VecDeque::from([pid]);
    while let Some(current) = queue.pop_front() {
        for &child in children.get(&current).into_iter().flatten() {
            if child != pid && !ordered.contains(&child) {
                ordered.push(child);
                queue.push_back(child);
            }
        }
    }
    ordered
}

fn ignore_missing(result: nix::Result<()>) -> io::Result<()> {
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
    }
}
