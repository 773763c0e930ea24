//! Advisory singleton gate.
//!
//! The child owns the singleton lock for its whole lifetime; the parent only probes
//! it. Nothing forces a process to participate, and there is a window between the
//! parent's probe and the child's claim in which two children can both be spawned.
//! The loser of the claim learns about it from [`Claim::Contended`] and is expected
//! to exit on its own.
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::{
    error::NamedObjectError,
    named::{NamedLock, NamedObjects},
    naming::ObjectName,
};

/// Locks owned by this process. They are never released explicitly; the OS drops
/// them when the process ends.
static HELD_LOCKS: OnceLock<Mutex<Vec<Box<dyn NamedLock>>>> = OnceLock::new();

fn held_locks() -> std::sync::MutexGuard<'static, Vec<Box<dyn NamedLock>>> {
    HELD_LOCKS
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome of claiming the singleton lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This process created and now owns the lock.
    Owned,
    /// Another live process owns it.
    Contended,
}

/// Detects and advertises a live child of one identity.
#[derive(Debug, Clone)]
pub struct SingletonGate {
    objects: Arc<dyn NamedObjects>,
}

impl SingletonGate {
    /// Creates a gate over `objects`.
    pub fn new(objects: Arc<dyn NamedObjects>) -> Self {
        Self { objects }
    }

    /// Parent side: whether a child already owns `name`.
    pub fn is_held(&self, name: &ObjectName) -> Result<bool, NamedObjectError> {
        let held = self.objects.probe_lock(name)?;
        debug!("Singleton probe for {name}: held={held}");
        Ok(held)
    }

    /// Child side: takes ownership of `name` for the rest of the process lifetime.
    pub fn claim(&self, name: &ObjectName) -> Result<Claim, NamedObjectError> {
        match self.objects.create_lock(name)? {
            Some(lock) => {
                held_locks().push(lock);
                Ok(Claim::Owned)
            }
            None => Ok(Claim::Contended),
        }
    }
}
