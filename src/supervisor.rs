//! Parent side: starts at most one child per identity and keeps it running.
use std::{
    process::Child,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    channel::{SignalChannel, StartupRendezvous},
    config::{SpawnSpec, SupervisionOptions},
    constants::{EXIT_POLL_INTERVAL, SUPERVISE_POLL_INTERVAL},
    error::{Result, TetherError},
    gate::SingletonGate,
    named::{NamedObjects, NamedSignal, default_objects},
    naming::NamedHandleSet,
    process::{ChildProcess, ChildState, Generation, Shared, kill_process_tree},
};

/// Starts singleton children and supervises their restarts.
#[derive(Debug, Clone)]
pub struct ChildSupervisor {
    objects: Arc<dyn NamedObjects>,
}

impl Default for ChildSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildSupervisor {
    /// Supervisor over the runtime directories of the environment.
    pub fn new() -> Self {
        Self::with_objects(default_objects())
    }

    /// Supervisor over a custom named-object backend.
    pub fn with_objects(objects: Arc<dyn NamedObjects>) -> Self {
        Self { objects }
    }

    /// Starts `spec` unless a child of the same identity is already running.
    ///
    /// Returns `Ok(None)` without spawning when the singleton lock is held. Otherwise
    /// blocks until the child registers or `startup_timeout` elapses (`None` waits
    /// forever). A child that misses the deadline is killed and
    /// [`TetherError::StartupTimeout`] is returned.
    ///
    /// With `restart_on_exit`, a dedicated thread re-spawns the child after every
    /// exit that was not requested through the returned handle. Restarted
    /// generations wait for registration without a deadline.
    pub fn start_singleton_child(
        &self,
        spec: &SpawnSpec,
        options: &SupervisionOptions,
        startup_timeout: Option<Duration>,
    ) -> Result<Option<ChildProcess>> {
        let names =
            NamedHandleSet::resolve(&spec.program, spec.working_dir.as_deref(), options)?;
        debug!("Singleton name for '{}': {}", spec.program.display(), names.singleton);

        let identity = Identity {
            gate: SingletonGate::new(Arc::clone(&self.objects)),
            channel: SignalChannel::new(Arc::clone(&self.objects), names),
            spec: spec.clone(),
            restart_delay: options.restart_delay,
        };

        let Some(first) = identity.spawn_generation(startup_timeout, None)? else {
            info!(
                "Child process '{}' is already running; not starting another instance",
                spec.program.display()
            );
            return Ok(None);
        };

        let handle = ChildProcess::new(first);
        if options.restart_on_exit {
            let shared = handle.shared();
            let spawned = thread::Builder::new()
                .name(format!("tether-supervise-{}", handle.pid()))
                .spawn(move || identity.supervise(shared));
            if let Err(source) = spawned {
                handle.terminate(Duration::ZERO)?;
                return Err(TetherError::SpawnError {
                    program: spec.program.clone(),
                    source,
                });
            }
        }

        Ok(Some(handle))
    }
}

/// Everything needed to spawn one more generation of an identity.
struct Identity {
    gate: SingletonGate,
    channel: SignalChannel,
    spec: SpawnSpec,
    restart_delay: Duration,
}

impl Identity {
    /// Probes, spawns and waits for registration. `None` when another instance owns
    /// the singleton lock.
    ///
    /// A restart passes the handle it spawns for as `shared`; the process is then
    /// visible to disposal while it starts, and startup is abandoned once the handle
    /// is disposed.
    fn spawn_generation(
        &self,
        startup_timeout: Option<Duration>,
        shared: Option<&Shared>,
    ) -> Result<Option<Generation>> {
        let names = self.channel.names();
        if self.gate.is_held(&names.singleton)? {
            return Ok(None);
        }

        let terminate = self.channel.create_terminate()?;
        let rendezvous = self.channel.arm_startup()?;
        let mut child = self
            .spec
            .command()
            .spawn()
            .map_err(|source| TetherError::SpawnError {
                program: self.spec.program.clone(),
                source,
            })?;
        info!(
            "Started child process '{}' with pid {}",
            self.spec.program.display(),
            child.id()
        );
        if let Some(shared) = shared {
            shared.lock().starting_pid = Some(child.id());
        }

        let started = self.await_startup(&rendezvous, &mut child, startup_timeout, shared);
        if let Some(shared) = shared {
            shared.lock().starting_pid = None;
        }
        match started {
            Ok(()) => {
                debug!("Child process {} registered", child.id());
                Ok(Some(Generation { child, terminate }))
            }
            Err(err) => {
                abort_generation(&mut child, terminate.as_ref());
                Err(err)
            }
        }
    }

    fn await_startup(
        &self,
        rendezvous: &StartupRendezvous,
        child: &mut Child,
        startup_timeout: Option<Duration>,
        shared: Option<&Shared>,
    ) -> Result<()> {
        let deadline = startup_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let slice = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(EXIT_POLL_INTERVAL),
                None => EXIT_POLL_INTERVAL,
            };
            if rendezvous.wait(Some(slice))? {
                return Ok(());
            }

            // reap under the handle lock; disposal kills `starting_pid` while holding it
            let exited = {
                let mut state = shared.map(Shared::lock);
                if state.as_ref().is_some_and(|state| state.disposed) {
                    return Err(TetherError::StartupAbandoned {
                        program: self.spec.program.clone(),
                    });
                }
                let exited = child.try_wait().map_err(|source| TetherError::SpawnError {
                    program: self.spec.program.clone(),
                    source,
                })?;
                if let Some(state) = state.as_mut()
                    && exited.is_some()
                {
                    state.starting_pid = None;
                }
                exited
            };
            if let Some(status) = exited {
                if rendezvous.wait(Some(Duration::ZERO))? {
                    return Ok(());
                }
                return Err(TetherError::StartupExited {
                    program: self.spec.program.clone(),
                    code: status.code(),
                });
            }

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(TetherError::StartupTimeout {
                    program: self.spec.program.clone(),
                    timeout: startup_timeout.unwrap_or_default(),
                });
            }
        }
    }

    /// Body of the supervising thread. Returns once the handle is disposed.
    fn supervise(self, shared: Arc<Shared>) {
        loop {
            let Some(exited_at) = wait_for_unexpected_exit(&shared) else {
                return;
            };
            if !wait_for_restart_delay(&shared, exited_at + self.restart_delay) {
                return;
            }

            let outcome = self.spawn_generation(None, Some(shared.as_ref()));
            let mut state = shared.lock();
            state.spawning = false;
            match outcome {
                Ok(Some(next)) => {
                    let abandoned = state.disposed;
                    state.install(next);
                    if abandoned {
                        debug!(
                            "Handle disposed while pid {} was starting; termination requested",
                            state.pid()
                        );
                    } else {
                        info!(
                            "Restarted child process '{}' as pid {} (generation {})",
                            self.spec.program.display(),
                            state.pid(),
                            state.generation()
                        );
                    }
                    drop(state);
                    shared.changed.notify_all();
                    if abandoned {
                        return;
                    }
                }
                Ok(None) => {
                    warn!(
                        "Another instance of '{}' took over; supervision ends",
                        self.spec.program.display()
                    );
                    state.end_supervision(None);
                    drop(state);
                    shared.changed.notify_all();
                    return;
                }
                Err(err) if state.disposed => {
                    debug!("Restart of '{}' stopped: {err}", self.spec.program.display());
                    drop(state);
                    shared.changed.notify_all();
                    return;
                }
                Err(err) => {
                    error!(
                        "Failed to restart child process '{}': {err}",
                        self.spec.program.display()
                    );
                    state.end_supervision(Some(err.to_string()));
                    drop(state);
                    shared.changed.notify_all();
                    return;
                }
            }
        }
    }
}

/// Blocks until the current generation exits. `None` when the handle was disposed
/// first.
fn wait_for_unexpected_exit(shared: &Shared) -> Option<Instant> {
    let mut state = shared.lock();
    loop {
        if state.disposed {
            return None;
        }
        match state.poll_exit() {
            Ok(Some(status)) => {
                warn!(
                    "Child process {} exited unexpectedly with {status}; restart pending",
                    state.pid()
                );
                state.state = ChildState::RestartPending;
                return Some(Instant::now());
            }
            Ok(None) => {}
            Err(err) => {
                error!("Failed to poll child process {}: {err}", state.pid());
                state.end_supervision(Some(err.to_string()));
                return None;
            }
        }
        state = shared
            .changed
            .wait_timeout(state, SUPERVISE_POLL_INTERVAL)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .0;
    }
}

/// Sleeps until `restart_at` unless the handle is disposed meanwhile. On success the
/// handle is moved to `Starting` with a spawn in flight.
fn wait_for_restart_delay(shared: &Shared, restart_at: Instant) -> bool {
    let mut state = shared.lock();
    loop {
        if state.disposed {
            debug!("Handle disposed while restart was pending");
            return false;
        }
        let now = Instant::now();
        if now >= restart_at {
            state.state = ChildState::Starting;
            state.spawning = true;
            return true;
        }
        state = shared
            .changed
            .wait_timeout(state, restart_at - now)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .0;
    }
}

/// Tears down a generation that never registered: the termination request goes out
/// and the tree is killed right away.
fn abort_generation(child: &mut Child, terminate: &dyn NamedSignal) {
    let pid = child.id();
    if let Err(err) = terminate.set() {
        debug!("Failed to signal termination to child process {pid}: {err}");
    }
    if let Err(err) = terminate.remove() {
        debug!("Failed to remove termination signal {}: {err}", terminate.name());
    }

    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => {
            if let Err(err) = kill_process_tree(pid) {
                warn!("Failed to kill child process {pid}: {err}");
            }
            if let Err(err) = child.wait() {
                warn!("Failed to reap child process {pid}: {err}");
            }
        }
    }
}
