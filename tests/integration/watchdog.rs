#[path = "common/mod.rs"]
mod common;

use std::{
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use common::{
    Sandbox, kill, no_restart, tether_bin, wait_for_file_value, wait_for_pids,
    wait_for_process_exit,
};
use nix::sys::signal::Signal;
use tether::constants::RUNTIME_DIR_ENV;

const STARTUP: Option<Duration> = Some(Duration::from_secs(10));

#[test]
fn child_exits_promptly_after_termination_request() {
    let sandbox = Sandbox::new();
    let handle = sandbox
        .supervisor()
        .start_singleton_child(&sandbox.child_spec(&[]), &no_restart(), STARTUP)
        .expect("start child")
        .expect("no other instance");
    wait_for_pids(&sandbox.pid_file(), 1, Duration::from_secs(5));

    let started = Instant::now();
    handle.terminate(Duration::from_secs(10)).expect("terminate");

    assert!(started.elapsed() < Duration::from_secs(2));
    wait_for_file_value(&sandbox.exit_file(), "termination-requested");
}

#[test]
fn child_exits_when_its_parent_is_killed() {
    let sandbox = Sandbox::new();
    let bin = tether_bin();
    let mut parent = Command::new(&bin)
        .env(RUNTIME_DIR_ENV, sandbox.runtime_root())
        .args(["run", "--startup-timeout", "10s", "--"])
        .arg(&bin)
        .arg("child")
        .arg("--pid-file")
        .arg(sandbox.pid_file())
        .arg("--exit-file")
        .arg(sandbox.exit_file())
        .stdin(Stdio::null())
        .spawn()
        .expect("spawn tether run");

    let child_pid = wait_for_pids(&sandbox.pid_file(), 1, Duration::from_secs(10))[0];
    kill(parent.id(), Signal::SIGKILL);
    parent.wait().expect("reap parent");

    wait_for_file_value(&sandbox.exit_file(), "parent-exited");
    wait_for_process_exit(child_pid);
}

#[test]
fn interrupt_cancels_the_watchdog() {
    let sandbox = Sandbox::new();
    let handle = sandbox
        .supervisor()
        .start_singleton_child(&sandbox.child_spec(&[]), &no_restart(), STARTUP)
        .expect("start child")
        .expect("no other instance");
    let pid = wait_for_pids(&sandbox.pid_file(), 1, Duration::from_secs(5))[0];

    kill(pid, Signal::SIGINT);

    wait_for_file_value(&sandbox.exit_file(), "cancelled");
    handle.dispose().expect("dispose");
    assert_eq!(handle.last_exit().and_then(|exit| exit.code), Some(0));
}

#[test]
fn standalone_child_is_refused() {
    let sandbox = Sandbox::new();
    let status = Command::new(tether_bin())
        .env(RUNTIME_DIR_ENV, sandbox.runtime_root())
        .arg("child")
        .arg("--pid-file")
        .arg(sandbox.pid_file())
        .status()
        .expect("run standalone child");

    assert_eq!(status.code(), Some(3));
    assert!(!sandbox.pid_file().exists());
}
