//! Startup and termination signals of one supervised identity.
//!
//! Names never depend on the generation: every restart binds to the same two
//! signals, which is what keeps a restarted child reachable through the original
//! handle.
use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    error::NamedObjectError,
    named::{NamedObjects, NamedSignal, ResetMode},
    naming::NamedHandleSet,
};

/// Access to the startup and termination signals of one identity.
#[derive(Debug, Clone)]
pub struct SignalChannel {
    objects: Arc<dyn NamedObjects>,
    names: NamedHandleSet,
}

impl SignalChannel {
    /// Binds the channel to a set of names.
    pub fn new(objects: Arc<dyn NamedObjects>, names: NamedHandleSet) -> Self {
        Self { objects, names }
    }

    /// Names used by this channel.
    pub fn names(&self) -> &NamedHandleSet {
        &self.names
    }

    /// Parent side: creates the latching startup signal in the cleared state.
    /// The signal disappears when the returned guard is dropped.
    pub fn arm_startup(&self) -> Result<StartupRendezvous, NamedObjectError> {
        let signal = self
            .objects
            .create_signal(&self.names.startup, ResetMode::Manual)?;
        signal.reset()?;
        Ok(StartupRendezvous { signal })
    }

    /// Parent side: creates, or rebinds to, the self-resetting termination signal.
    pub fn create_terminate(&self) -> Result<Box<dyn NamedSignal>, NamedObjectError> {
        self.objects
            .create_signal(&self.names.terminate, ResetMode::Auto)
    }

    /// Child side: the startup signal if a parent is waiting for this identity.
    pub fn open_startup(&self) -> Result<Option<Box<dyn NamedSignal>>, NamedObjectError> {
        self.objects.open_signal(&self.names.startup)
    }

    /// Child side: the termination signal if a parent created one.
    pub fn open_terminate(&self) -> Result<Option<Box<dyn NamedSignal>>, NamedObjectError> {
        self.objects.open_signal(&self.names.terminate)
    }
}

/// The parent's end of the startup handshake.
#[derive(Debug)]
pub struct StartupRendezvous {
    signal: Box<dyn NamedSignal>,
}

impl StartupRendezvous {
    /// Blocks until the child signalled readiness or `timeout` elapsed.
    /// A child that registered before this call still counts.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, NamedObjectError> {
        self.signal.wait(timeout)
    }
}

impl Drop for StartupRendezvous {
    fn drop(&mut self) {
        if let Err(err) = self.signal.remove() {
            debug!("Failed to remove startup signal {}: {err}", self.signal.name());
        }
    }
}
