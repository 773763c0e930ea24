//! Directories backing the global and per-user namespaces.
use std::{
    env, fs,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

use nix::unistd::getuid;
use tracing::debug;

use crate::{
    constants::{RUNTIME_DIR_ENV, RUNTIME_DIR_NAME},
    error::NamedObjectError,
    naming::Namespace,
};

/// Where the files of each namespace live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    global_dir: PathBuf,
    local_dir: PathBuf,
}

impl RuntimeLayout {
    /// Honors `TETHER_RUNTIME_DIR`, otherwise uses the host defaults.
    pub fn from_env() -> Self {
        match env::var_os(RUNTIME_DIR_ENV) {
            Some(root) if !root.is_empty() => Self::under_root(root),
            _ => Self::host_default(),
        }
    }

    /// Both namespaces below one root: `<root>/global` and `<root>/user-<uid>`.
    pub fn under_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            global_dir: root.join("global"),
            local_dir: root.join(format!("user-{}", getuid())),
        }
    }

    /// `/dev/shm/tether` for global objects, `$XDG_RUNTIME_DIR/tether` for local ones.
    /// Both fall back to the temp dir when the preferred location is absent.
    fn host_default() -> Self {
        let shm = Path::new("/dev/shm");
        let global_dir = if shm.is_dir() {
            shm.join(RUNTIME_DIR_NAME)
        } else {
            env::temp_dir().join(RUNTIME_DIR_NAME)
        };

        let local_dir = env::var_os("XDG_RUNTIME_DIR")
            .filter(|dir| !dir.is_empty())
            .map(|dir| PathBuf::from(dir).join(RUNTIME_DIR_NAME))
            .unwrap_or_else(|| env::temp_dir().join(format!("{RUNTIME_DIR_NAME}-{}", getuid())));

        Self {
            global_dir,
            local_dir,
        }
    }

    /// Directory of `namespace`, without touching the file system.
    pub fn dir(&self, namespace: Namespace) -> &Path {
        match namespace {
            Namespace::Global => &self.global_dir,
            Namespace::Local => &self.local_dir,
        }
    }

    /// Creates the directory of `namespace` if needed and returns it.
    ///
    /// Global directories are world-writable with the sticky bit; local ones are
    /// private to the user. Permissions are only adjusted on directories we own.
    pub fn ensure_dir(&self, namespace: Namespace) -> Result<PathBuf, NamedObjectError> {
        let dir = self.dir(namespace).to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| NamedObjectError::Namespace {
            dir: dir.clone(),
            source,
        })?;

        let mode = match namespace {
            Namespace::Global => 0o1777,
            Namespace::Local => 0o700,
        };
        if let Ok(metadata) = fs::metadata(&dir)
            && metadata.uid() == getuid().as_raw()
            && metadata.permissions().mode() & 0o7777 != mode
            && let Err(err) = fs::set_permissions(&dir, fs::Permissions::from_mode(mode))
        {
            debug!("Could not set mode {mode:o} on {}: {err}", dir.display());
        }

        Ok(dir)
    }
}
