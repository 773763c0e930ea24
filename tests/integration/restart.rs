#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    thread,
    time::{Duration, Instant},
};

use common::{
    Sandbox, is_process_alive, kill, no_restart, options, read_pids, wait_for_file_value,
    wait_for_pids, wait_until,
};
use nix::sys::signal::Signal;
use tether::process::ChildState;

const STARTUP: Option<Duration> = Some(Duration::from_secs(10));

#[test]
fn killed_child_is_restarted_into_the_same_handle() {
    let sandbox = Sandbox::new();
    let handle = sandbox
        .supervisor()
        .start_singleton_child(
            &sandbox.child_spec(&[]),
            &options(Duration::from_secs(1)),
            STARTUP,
        )
        .expect("start child")
        .expect("no other instance");
    let first_pid = wait_for_pids(&sandbox.pid_file(), 1, Duration::from_secs(5))[0];
    assert_eq!(handle.pid(), first_pid);

    let killed_at = Instant::now();
    kill(first_pid, Signal::SIGKILL);

    let pids = wait_for_pids(&sandbox.pid_file(), 2, Duration::from_secs(15));
    assert!(killed_at.elapsed() >= Duration::from_secs(1));
    assert_ne!(pids[1], first_pid);

    wait_until("handle to adopt the new generation", Duration::from_secs(5), || {
        handle.generation() == 2
    });
    assert_eq!(handle.pid(), pids[1]);
    assert_eq!(handle.state(), ChildState::Running);
    let exit = handle.last_exit().expect("first exit recorded");
    assert_eq!(exit.pid, first_pid);
    assert_eq!(exit.signal, Some(libc::SIGKILL));

    handle.terminate(Duration::from_secs(5)).expect("terminate");
    assert!(!is_process_alive(pids[1]));
    wait_for_file_value(&sandbox.exit_file(), "termination-requested");
}

#[test]
fn every_crash_is_followed_by_a_new_generation() {
    let sandbox = Sandbox::new();
    let handle = sandbox
        .supervisor()
        .start_singleton_child(
            &sandbox.child_spec(&[]),
            &options(Duration::from_millis(200)),
            STARTUP,
        )
        .expect("start child")
        .expect("no other instance");

    for generation in 1..=3 {
        let pids = wait_for_pids(&sandbox.pid_file(), generation, Duration::from_secs(10));
        kill(pids[generation - 1], Signal::SIGKILL);
    }

    let pids = wait_for_pids(&sandbox.pid_file(), 4, Duration::from_secs(10));
    wait_until("fourth generation", Duration::from_secs(5), || {
        handle.generation() == 4
    });
    assert_eq!(handle.pid(), pids[3]);

    handle.terminate(Duration::from_secs(5)).expect("terminate");
    assert!(pids.iter().all(|pid| !is_process_alive(*pid)));
}

#[test]
fn disabled_restart_leaves_the_child_down() {
    let sandbox = Sandbox::new();
    let handle = sandbox
        .supervisor()
        .start_singleton_child(&sandbox.child_spec(&[]), &no_restart(), STARTUP)
        .expect("start child")
        .expect("no other instance");
    let pid = wait_for_pids(&sandbox.pid_file(), 1, Duration::from_secs(5))[0];

    kill(pid, Signal::SIGKILL);
    wait_until("child exit", Duration::from_secs(5), || {
        handle.has_exited().unwrap()
    });
    thread::sleep(Duration::from_millis(1500));

    assert_eq!(read_pids(&sandbox.pid_file()), vec![pid]);
    assert_eq!(handle.generation(), 1);
    assert!(!handle.is_disposed());
    handle.dispose().expect("dispose");
}

#[test]
fn disposal_during_restart_delay_cancels_the_restart() {
    let sandbox = Sandbox::new();
    let handle = sandbox
        .supervisor()
        .start_singleton_child(
            &sandbox.child_spec(&[]),
            &options(Duration::from_secs(30)),
            STARTUP,
        )
        .expect("start child")
        .expect("no other instance");
    let pid = wait_for_pids(&sandbox.pid_file(), 1, Duration::from_secs(5))[0];

    kill(pid, Signal::SIGKILL);
    wait_until("restart to be scheduled", Duration::from_secs(5), || {
        handle.state() == ChildState::RestartPending
    });

    let started = Instant::now();
    handle.dispose().expect("dispose");
    assert!(started.elapsed() < Duration::from_secs(2));

    thread::sleep(Duration::from_millis(500));
    assert_eq!(handle.state(), ChildState::Disposed);
    assert_eq!(read_pids(&sandbox.pid_file()), vec![pid]);
}

#[test]
fn restart_yields_to_an_instance_that_took_over() {
    let sandbox = Sandbox::new();
    let spec = sandbox.child_spec(&[]);
    let opts = options(Duration::from_secs(2));

    let original = sandbox
        .supervisor()
        .start_singleton_child(&spec, &opts, STARTUP)
        .expect("start child")
        .expect("no other instance");
    let pid = wait_for_pids(&sandbox.pid_file(), 1, Duration::from_secs(5))[0];

    kill(pid, Signal::SIGKILL);
    wait_until("restart to be scheduled", Duration::from_secs(5), || {
        original.state() == ChildState::RestartPending
    });

    let usurper = sandbox
        .supervisor()
        .start_singleton_child(&spec, &no_restart(), STARTUP)
        .expect("start competing child")
        .expect("lock is free while restart is pending");

    wait_until("original supervision to end", Duration::from_secs(10), || {
        original.is_disposed()
    });
    assert!(original.last_error().is_none());
    assert_eq!(original.generation(), 1);
    assert!(is_process_alive(usurper.pid()));

    usurper.terminate(Duration::from_secs(5)).expect("terminate usurper");
    assert_eq!(
        fs::read_to_string(sandbox.exit_file()).unwrap().trim(),
        "termination-requested"
    );
}
