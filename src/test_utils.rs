use std::sync::{Mutex, MutexGuard, OnceLock};

/// Serialises tests that modify process-wide environment variables such as
/// `TETHER_RUNTIME_DIR`.
static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
