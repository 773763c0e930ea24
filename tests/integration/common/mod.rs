#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tempfile::TempDir;
use tether::{
    config::{SpawnSpec, SupervisionOptions},
    constants::RUNTIME_DIR_ENV,
    named::{FileObjects, NamedObjects},
    naming::NamedHandleSet,
    supervisor::ChildSupervisor,
};

/// Path of the `tether` binary under test.
pub fn tether_bin() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("tether").to_path_buf()
}

/// Private runtime root plus the files a sample child reports through.
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Root handed to children through `TETHER_RUNTIME_DIR`.
    pub fn runtime_root(&self) -> PathBuf {
        self.dir.path().join("runtime")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.path().join("child.pids")
    }

    pub fn exit_file(&self) -> PathBuf {
        self.dir.path().join("child.exit")
    }

    pub fn objects(&self) -> Arc<dyn NamedObjects> {
        Arc::new(FileObjects::under_root(self.runtime_root()))
    }

    pub fn supervisor(&self) -> ChildSupervisor {
        ChildSupervisor::with_objects(self.objects())
    }

    /// Spec running `program child` against this sandbox.
    pub fn child_spec_for(&self, program: &Path, extra: &[&str]) -> SpawnSpec {
        SpawnSpec::new(program)
            .arg("child")
            .arg("--pid-file")
            .arg(self.pid_file().display().to_string())
            .arg("--exit-file")
            .arg(self.exit_file().display().to_string())
            .args(extra.iter().copied())
            .env(RUNTIME_DIR_ENV, self.runtime_root().display().to_string())
    }

    /// Spec running `tether child` against this sandbox.
    pub fn child_spec(&self, extra: &[&str]) -> SpawnSpec {
        self.child_spec_for(&tether_bin(), extra)
    }

    /// Whether the singleton lock of `program` is held in this sandbox.
    pub fn is_held(&self, program: &Path, options: &SupervisionOptions) -> bool {
        let names = NamedHandleSet::resolve(program, None, options).expect("resolve names");
        self.objects()
            .probe_lock(&names.singleton)
            .expect("probe singleton lock")
    }

    /// Copies the binary under test to `name` inside the sandbox.
    pub fn copy_bin(&self, name: &str) -> PathBuf {
        let target = self.dir.path().join(name);
        fs::copy(tether_bin(), &target).expect("failed to copy tether binary");
        target
    }
}

pub fn options(restart_delay: Duration) -> SupervisionOptions {
    SupervisionOptions {
        restart_delay,
        ..SupervisionOptions::default()
    }
}

pub fn no_restart() -> SupervisionOptions {
    SupervisionOptions {
        restart_on_exit: false,
        ..SupervisionOptions::default()
    }
}

pub fn read_pids(path: &Path) -> Vec<u32> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

pub fn wait_for_pids(path: &Path, expected: usize, timeout: Duration) -> Vec<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        let pids = read_pids(path);
        if pids.len() >= expected {
            return pids;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {expected} pids in {:?}", path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

pub fn wait_for_file_value(path: &Path, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && content.trim() == expected
        {
            return;
        }

        if Instant::now() >= deadline {
            panic!(
                "Timed out waiting for value '{}' in {:?} (found {:?})",
                expected,
                path,
                fs::read_to_string(path).ok()
            );
        }

        thread::sleep(Duration::from_millis(50));
    }
}

pub fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("Timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Alive means present in the process table and not a zombie.
pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}

pub fn wait_for_process_exit(pid: u32) {
    wait_until(&format!("pid {pid} to exit"), Duration::from_secs(10), || {
        !is_process_alive(pid)
    });
}

pub fn kill(pid: u32, signal: nix::sys::signal::Signal) {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal)
        .expect("failed to signal process");
}
