//! Constants shared by the parent and child sides of tether.
//!
//! Both processes derive object names from these values, so changing any of the
//! naming constants breaks compatibility with already deployed binaries.

use std::time::Duration;

// ============================================================================
// Named Object Tags
// ============================================================================

/// Purpose tag of the mutual-exclusion object owned by a registered child.
pub const SINGLETON_TAG: &str = "Singleton";

/// Purpose tag of the latching signal set by the child once it is ready.
pub const PROCESS_STARTUP_TAG: &str = "ProcessStartup";

/// Purpose tag of the self-resetting signal set by the parent to request shutdown.
pub const PROCESS_TERMINATE_TAG: &str = "ProcessTerminate";

/// Identifier used when the caller does not pick one.
pub const DEFAULT_SINGLETON_IDENTIFIER: &str = "6BCA8284CC0E4B70B8836DC3B72FD8B7";

/// Number of hex characters kept from the executable path digest.
pub const PATH_HASH_LEN: usize = 32;

// ============================================================================
// Runtime Directories
// ============================================================================

/// Overrides the root directory holding both namespaces.
/// Layout below the root: `global/` and `user-<uid>/`.
pub const RUNTIME_DIR_ENV: &str = "TETHER_RUNTIME_DIR";

/// Directory name used below `/dev/shm`, `$XDG_RUNTIME_DIR` or the temp dir.
pub const RUNTIME_DIR_NAME: &str = "tether";

/// File suffix of lock objects.
pub const LOCK_SUFFIX: &str = ".lock";

/// File suffix of signal objects.
pub const SIGNAL_SUFFIX: &str = ".signal";

// ============================================================================
// Supervision Defaults
// ============================================================================

/// Delay between an unexpected exit and the next spawn attempt.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Grace period the CLI parent gives its child on Ctrl-C.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period a dropped handle gives its child before killing it.
pub const DROP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Polling Intervals
// ============================================================================

/// Interval between reads of a signal while blocking on it.
pub const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Interval between exit checks of the supervised process.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Interval at which the supervising thread looks for an unexpected exit.
pub const SUPERVISE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interval of the child-side watchdog loop.
pub const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_millis(50);
