//! File-backed named objects.
//!
//! A lock is a `<name>.lock` file held with an exclusive `flock`; the kernel drops
//! the lock when the last descriptor closes, which includes process death. A
//! signal is a `<name>.signal` file holding two bytes, the state (`0`/`1`) and the
//! reset mode (`M`/`A`), mutated under an exclusive `flock`.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use tracing::{debug, warn};

use super::{NamedLock, NamedObjects, NamedSignal, ResetMode};
use crate::{
    constants::{LOCK_SUFFIX, SIGNAL_SUFFIX},
    error::NamedObjectError,
    naming::{Namespace, ObjectName},
    runtime::RuntimeLayout,
};

const SIGNAL_SET: u8 = b'1';
const SIGNAL_CLEAR: u8 = b'0';

const LOCK_CLAIM_ATTEMPTS: u32 = 5;
const LOCK_CLAIM_RETRY: Duration = Duration::from_millis(2);

/// Named objects stored as files below a [`RuntimeLayout`].
#[derive(Debug, Clone)]
pub struct FileObjects {
    layout: RuntimeLayout,
}

impl FileObjects {
    /// Uses [`RuntimeLayout::from_env`].
    pub fn from_env() -> Self {
        Self::new(RuntimeLayout::from_env())
    }

    /// Keeps every object below `root`.
    pub fn under_root(root: impl Into<PathBuf>) -> Self {
        Self::new(RuntimeLayout::under_root(root))
    }

    /// Uses an explicit layout.
    pub fn new(layout: RuntimeLayout) -> Self {
        Self { layout }
    }

    /// The layout objects are stored in.
    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    fn object_path(&self, name: &ObjectName, suffix: &str) -> PathBuf {
        self.layout
            .dir(name.namespace())
            .join(format!("{}{suffix}", name.file_stem()))
    }

    fn prepare_path(
        &self,
        name: &ObjectName,
        suffix: &str,
    ) -> Result<PathBuf, NamedObjectError> {
        self.layout.ensure_dir(name.namespace())?;
        Ok(self.object_path(name, suffix))
    }
}

impl NamedObjects for FileObjects {
    fn create_lock(
        &self,
        name: &ObjectName,
    ) -> Result<Option<Box<dyn NamedLock>>, NamedObjectError> {
        let path = self.prepare_path(name, LOCK_SUFFIX)?;
        let file = open_shared_file(&path, name)?;

        // A concurrent probe holds a shared lock for an instant; only persistent
        // contention means a live owner.
        let mut attempt = 1;
        loop {
            match fs2::FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) if is_contended(&err) && attempt < LOCK_CLAIM_ATTEMPTS => {
                    attempt += 1;
                    thread::sleep(LOCK_CLAIM_RETRY);
                }
                Err(err) if is_contended(&err) => {
                    debug!("Lock {name} is owned by another process");
                    return Ok(None);
                }
                Err(source) => return Err(io_error(name, source)),
            }
        }

        let pid = std::process::id().to_string();
        if let Err(err) = file
            .set_len(0)
            .and_then(|_| file.write_all_at(pid.as_bytes(), 0))
        {
            debug!("Could not record owner pid in {}: {err}", path.display());
        }
        debug!("Took ownership of lock {name}");
        Ok(Some(Box::new(FileLock {
            name: name.clone(),
            _file: file,
        })))
    }

    fn probe_lock(&self, name: &ObjectName) -> Result<bool, NamedObjectError> {
        let path = self.object_path(name, LOCK_SUFFIX);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(io_error(name, source)),
        };

        match fs2::FileExt::try_lock_shared(&file) {
            Ok(()) => {
                let _ = fs2::FileExt::unlock(&file);
                Ok(false)
            }
            Err(err) if is_contended(&err) => Ok(true),
            Err(source) => Err(io_error(name, source)),
        }
    }

    fn create_signal(
        &self,
        name: &ObjectName,
        mode: ResetMode,
    ) -> Result<Box<dyn NamedSignal>, NamedObjectError> {
        let path = self.prepare_path(name, SIGNAL_SUFFIX)?;
        let file = open_shared_file(&path, name)?;
        let signal = FileSignal {
            name: name.clone(),
            path,
            file,
            mode,
        };

        let existing = signal.locked(|file| {
            let mut header = [0u8; 2];
            let read = file.read_at(&mut header, 0)?;
            if read == 2
                && let Some(existing) = ResetMode::from_byte(header[1])
            {
                return Ok(Some(existing));
            }
            file.set_len(0)?;
            file.write_all_at(&[SIGNAL_CLEAR, mode.as_byte()], 0)?;
            Ok(None)
        })?;

        match existing {
            Some(existing) if existing != mode => {
                warn!("Signal {name} already exists as {existing:?}; keeping its reset mode");
                Ok(Box::new(FileSignal {
                    mode: existing,
                    ..signal
                }))
            }
            Some(_) => {
                debug!("Bound to existing signal {name}");
                Ok(Box::new(signal))
            }
            None => {
                debug!("Created signal {name} ({mode:?})");
                Ok(Box::new(signal))
            }
        }
    }

    fn open_signal(
        &self,
        name: &ObjectName,
    ) -> Result<Option<Box<dyn NamedSignal>>, NamedObjectError> {
        let path = self.object_path(name, SIGNAL_SUFFIX);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(name, source)),
        };

        let mut signal = FileSignal {
            name: name.clone(),
            path,
            file,
            mode: ResetMode::Manual,
        };
        let mode = signal.locked(|file| {
            let mut header = [0u8; 2];
            let read = file.read_at(&mut header, 0)?;
            Ok((read == 2).then(|| ResetMode::from_byte(header[1])).flatten())
        })?;

        match mode {
            Some(mode) => {
                signal.mode = mode;
                Ok(Some(Box::new(signal)))
            }
            // Created but not initialised yet: nobody can be waiting on it.
            None => Ok(None),
        }
    }
}

#[derive(Debug)]
struct FileLock {
    name: ObjectName,
    _file: File,
}

impl NamedLock for FileLock {
    fn name(&self) -> &ObjectName {
        &self.name
    }
}

#[derive(Debug)]
struct FileSignal {
    name: ObjectName,
    path: PathBuf,
    file: File,
    mode: ResetMode,
}

impl FileSignal {
    fn locked<T>(
        &self,
        op: impl FnOnce(&File) -> io::Result<T>,
    ) -> Result<T, NamedObjectError> {
        fs2::FileExt::lock_exclusive(&self.file)
            .map_err(|source| io_error(&self.name, source))?;
        let result = op(&self.file);
        let _ = fs2::FileExt::unlock(&self.file);
        result.map_err(|source| io_error(&self.name, source))
    }

    fn write_state(&self, state: u8) -> Result<(), NamedObjectError> {
        self.locked(|file| file.write_all_at(&[state], 0))
    }
}

impl NamedSignal for FileSignal {
    fn name(&self) -> &ObjectName {
        &self.name
    }

    fn mode(&self) -> ResetMode {
        self.mode
    }

    fn set(&self) -> Result<(), NamedObjectError> {
        self.write_state(SIGNAL_SET)
    }

    fn reset(&self) -> Result<(), NamedObjectError> {
        self.write_state(SIGNAL_CLEAR)
    }

    fn poll_once(&self) -> Result<bool, NamedObjectError> {
        let mode = self.mode;
        let state = self.locked(|file| {
            let mut state = [0u8; 1];
            if file.read_at(&mut state, 0)? == 0 {
                return Ok(SIGNAL_CLEAR);
            }
            if state[0] == SIGNAL_SET && mode == ResetMode::Auto {
                file.write_all_at(&[SIGNAL_CLEAR], 0)?;
            }
            Ok(state[0])
        })?;

        match state {
            SIGNAL_SET => Ok(true),
            SIGNAL_CLEAR => Ok(false),
            byte => Err(NamedObjectError::CorruptSignal {
                name: self.name.to_string(),
                byte,
            }),
        }
    }

    fn remove(&self) -> Result<(), NamedObjectError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io_error(&self.name, source)),
        }
    }
}

/// Opens (creating if needed) a file other participants of the namespace can use.
fn open_shared_file(path: &Path, name: &ObjectName) -> Result<File, NamedObjectError> {
    let mode = match name.namespace() {
        Namespace::Global => 0o666,
        Namespace::Local => 0o600,
    };
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(mode)
        .open(path)
        .map_err(|source| io_error(name, source))?;

    if name.namespace() == Namespace::Global
        && let Err(err) = file.set_permissions(fs::Permissions::from_mode(mode))
    {
        debug!("Could not widen permissions of {}: {err}", path.display());
    }

    Ok(file)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn io_error(name: &ObjectName, source: io::Error) -> NamedObjectError {
    NamedObjectError::Io {
        name: name.to_string(),
        source,
    }
}
