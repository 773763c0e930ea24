//! Named cross-process locks and signals.
//!
//! Objects are identified by [`ObjectName`], never by a local handle: two
//! acquisitions of the same name anywhere on the host refer to the same state.
//! [`NamedObjects`] is the only OS-dependent surface of the crate; [`FileObjects`]
//! is the Unix backend.

mod file;

pub use file::FileObjects;

use std::{
    fmt,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crate::{constants::SIGNAL_POLL_INTERVAL, error::NamedObjectError, naming::ObjectName};

/// How a signal behaves after a waiter observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Stays set until explicitly reset (latching).
    Manual,
    /// Cleared by the observation that consumed it.
    Auto,
}

impl ResetMode {
    pub(crate) const fn as_byte(&self) -> u8 {
        match self {
            Self::Manual => b'M',
            Self::Auto => b'A',
        }
    }

    pub(crate) const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'M' => Some(Self::Manual),
            b'A' => Some(Self::Auto),
            _ => None,
        }
    }
}

/// An owned mutual-exclusion object. Ownership ends when the value is dropped or
/// when the owning process exits for any reason.
pub trait NamedLock: Send + Sync + fmt::Debug {
    /// Name of the lock.
    fn name(&self) -> &ObjectName;
}

/// A cross-process signal bound by name.
pub trait NamedSignal: Send + Sync + fmt::Debug {
    /// Name of the signal.
    fn name(&self) -> &ObjectName;

    /// Reset behaviour recorded when the signal was first created.
    fn mode(&self) -> ResetMode;

    /// Sets the signal.
    fn set(&self) -> Result<(), NamedObjectError>;

    /// Clears the signal.
    fn reset(&self) -> Result<(), NamedObjectError>;

    /// Non-blocking observation. Consumes the state of an auto-reset signal.
    fn poll_once(&self) -> Result<bool, NamedObjectError>;

    /// Removes the name so later opens fail. Handles already bound keep working.
    fn remove(&self) -> Result<(), NamedObjectError>;

    /// Blocks until the signal is observed set or `timeout` elapses.
    /// `None` waits forever. Returns whether the signal was observed.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool, NamedObjectError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if self.poll_once()? {
                return Ok(true);
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                thread::sleep(SIGNAL_POLL_INTERVAL.min(deadline - now));
            } else {
                thread::sleep(SIGNAL_POLL_INTERVAL);
            }
        }
    }
}

/// Capability to create, probe and open named objects.
pub trait NamedObjects: Send + Sync + fmt::Debug {
    /// Creates the lock and tries to take ownership. `None` means another owner holds it.
    fn create_lock(
        &self,
        name: &ObjectName,
    ) -> Result<Option<Box<dyn NamedLock>>, NamedObjectError>;

    /// Whether some process currently owns the lock. Never takes ownership.
    fn probe_lock(&self, name: &ObjectName) -> Result<bool, NamedObjectError>;

    /// Creates the signal, or binds to the existing one without touching its state.
    fn create_signal(
        &self,
        name: &ObjectName,
        mode: ResetMode,
    ) -> Result<Box<dyn NamedSignal>, NamedObjectError>;

    /// Binds to an existing signal. `None` when nobody created it.
    fn open_signal(
        &self,
        name: &ObjectName,
    ) -> Result<Option<Box<dyn NamedSignal>>, NamedObjectError>;
}

/// The backend used when the caller does not provide one.
pub fn default_objects() -> Arc<dyn NamedObjects> {
    Arc::new(FileObjects::from_env())
}
