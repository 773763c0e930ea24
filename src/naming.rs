//! Derivation of the named objects shared by a parent and its supervised child.
//!
//! A name is `<namespace prefix><purpose tag><identifier>[<path hash>][<user>@<domain>]`.
//! Both processes compute it independently, so every input has to be derived the
//! same way on both sides: the executable path is made absolute, symlink-resolved
//! and lower-cased before hashing.
use std::{
    env, fmt,
    path::{Path, PathBuf},
};

use nix::unistd::{User, gethostname, getuid};
use sha2::{Digest, Sha256};

use crate::{
    config::SupervisionOptions,
    constants::{PATH_HASH_LEN, PROCESS_STARTUP_TAG, PROCESS_TERMINATE_TAG, SINGLETON_TAG},
    error::{Result, TetherError},
};

/// What a named object is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlePurpose {
    /// Lock owned by the live child.
    Singleton,
    /// Latching signal set by the child when it is ready.
    ProcessStartup,
    /// Self-resetting signal set by the parent to request shutdown.
    ProcessTerminate,
}

impl HandlePurpose {
    /// Tag placed in front of the identifier.
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Singleton => SINGLETON_TAG,
            Self::ProcessStartup => PROCESS_STARTUP_TAG,
            Self::ProcessTerminate => PROCESS_TERMINATE_TAG,
        }
    }
}

/// Visibility of a named object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Visible to every user of the host.
    Global,
    /// Visible to the current user only.
    Local,
}

impl Namespace {
    /// Prefix rendered in front of object names.
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::Global => "Global\\",
            Self::Local => "Local\\",
        }
    }
}

/// Fully qualified name of one cross-process object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectName {
    namespace: Namespace,
    name: String,
}

impl ObjectName {
    /// Builds a name from its parts.
    pub fn new(namespace: Namespace, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// Namespace the object lives in.
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Name without the namespace prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name usable as a single path component.
    pub fn file_stem(&self) -> String {
        self.name
            .chars()
            .map(|c| match c {
                '/' | '\\' | '\0' => '_',
                other => other,
            })
            .collect()
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.namespace.prefix(), self.name)
    }
}

/// The user a name is scoped to when per-user isolation is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Login name, or the numeric uid when the passwd entry is missing.
    pub user: String,
    /// Host name standing in for the user's domain.
    pub domain: String,
}

impl Principal {
    /// Resolves the principal of the current process.
    pub fn current() -> Self {
        let uid = getuid();
        let user = match User::from_uid(uid) {
            Ok(Some(user)) => user.name,
            _ => uid.to_string(),
        };
        let domain = gethostname()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self { user, domain }
    }
}

/// The three names used for one supervised identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedHandleSet {
    /// Lock advertising a live child.
    pub singleton: ObjectName,
    /// Signal set by the child once it is ready.
    pub startup: ObjectName,
    /// Signal set by the parent to request shutdown.
    pub terminate: ObjectName,
}

impl NamedHandleSet {
    /// Computes the names for an already resolved executable path.
    pub fn new(executable: &Path, options: &SupervisionOptions, principal: &Principal) -> Self {
        Self {
            singleton: handle_name(HandlePurpose::Singleton, executable, options, principal),
            startup: handle_name(HandlePurpose::ProcessStartup, executable, options, principal),
            terminate: handle_name(
                HandlePurpose::ProcessTerminate,
                executable,
                options,
                principal,
            ),
        }
    }

    /// Resolves `program` the same way the child will see itself and computes the names.
    pub fn resolve(
        program: &Path,
        working_dir: Option<&Path>,
        options: &SupervisionOptions,
    ) -> Result<Self> {
        let executable = resolve_executable(program, working_dir)?;
        Ok(Self::new(&executable, options, &Principal::current()))
    }

    /// Names for the executable of the calling process.
    pub fn for_current_exe(options: &SupervisionOptions) -> Result<Self> {
        let exe = env::current_exe().map_err(|source| TetherError::ExecutableResolveError {
            path: PathBuf::from("/proc/self/exe"),
            source,
        })?;
        Self::resolve(&exe, None, options)
    }
}

/// Builds the name of one object. Pure: the same inputs always give the same name.
pub fn handle_name(
    purpose: HandlePurpose,
    executable: &Path,
    options: &SupervisionOptions,
    principal: &Principal,
) -> ObjectName {
    let mut name = format!("{}{}", purpose.tag(), options.singleton_identifier);

    if options.allow_multiple_from_different_paths {
        name.push_str(&path_hash(executable));
    }

    let namespace = if options.allow_multiple_for_different_users {
        name.push_str(&format!("{}@{}", principal.user, principal.domain));
        Namespace::Local
    } else {
        Namespace::Global
    };

    ObjectName::new(namespace, name)
}

/// Hex digest of the lower-cased path, truncated to [`PATH_HASH_LEN`] characters.
pub fn path_hash(executable: &Path) -> String {
    let normalized = executable.to_string_lossy().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let mut hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    hex.truncate(PATH_HASH_LEN);
    hex
}

/// Turns a program as given to a spawn call into the absolute path the child will report
/// for itself. Bare names are looked up in `PATH`; relative paths are resolved against
/// `working_dir` or the current directory.
pub fn resolve_executable(program: &Path, working_dir: Option<&Path>) -> Result<PathBuf> {
    let resolve_error = |source: std::io::Error| TetherError::ExecutableResolveError {
        path: program.to_path_buf(),
        source,
    };

    let candidate = if program.is_absolute() {
        program.to_path_buf()
    } else if program.components().count() == 1 {
        search_path(program).ok_or_else(|| {
            resolve_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "not found in PATH",
            ))
        })?
    } else {
        let base = match working_dir {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => env::current_dir().map_err(resolve_error)?.join(dir),
            None => env::current_dir().map_err(resolve_error)?,
        };
        base.join(program)
    };

    Ok(candidate.canonicalize().unwrap_or(candidate))
}

fn search_path(program: &Path) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
