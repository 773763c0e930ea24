#[path = "common/mod.rs"]
mod common;

use std::{
    process::{Command as StdCommand, Stdio},
    time::Duration,
};

use assert_cmd::Command;
use common::{
    Sandbox, is_process_alive, kill, tether_bin, wait_for_file_value, wait_for_pids,
    wait_until,
};
use nix::sys::signal::Signal;
use predicates::prelude::*;
use tether::constants::{DEFAULT_SINGLETON_IDENTIFIER, RUNTIME_DIR_ENV};

fn spawn_run(sandbox: &Sandbox, extra: &[&str]) -> std::process::Child {
    let bin = tether_bin();
    StdCommand::new(&bin)
        .env(RUNTIME_DIR_ENV, sandbox.runtime_root())
        .arg("run")
        .args(extra)
        .arg("--")
        .arg(&bin)
        .arg("child")
        .arg("--pid-file")
        .arg(sandbox.pid_file())
        .arg("--exit-file")
        .arg(sandbox.exit_file())
        .stdin(Stdio::null())
        .spawn()
        .expect("spawn tether run")
}

#[test]
fn names_lists_all_three_objects() {
    Command::new(assert_cmd::cargo::cargo_bin!("tether"))
        .args(["names", "/bin/sh"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "Local\\Singleton{DEFAULT_SINGLETON_IDENTIFIER}"
        )))
        .stdout(predicate::str::contains("ProcessStartup"))
        .stdout(predicate::str::contains("ProcessTerminate"));
}

#[test]
fn shared_users_select_the_global_namespace() {
    Command::new(assert_cmd::cargo::cargo_bin!("tether"))
        .args(["names", "/bin/sh", "--shared-users", "--identifier", "Demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Global\\SingletonDemo"))
        .stdout(predicate::str::contains("@").not());
}

#[test]
fn run_without_program_fails() {
    let sandbox = Sandbox::new();
    Command::new(assert_cmd::cargo::cargo_bin!("tether"))
        .env(RUNTIME_DIR_ENV, sandbox.runtime_root())
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No program to supervise"));
}

#[test]
fn probe_follows_the_child_lifetime() {
    let sandbox = Sandbox::new();
    let probe = || {
        Command::new(assert_cmd::cargo::cargo_bin!("tether"))
            .env(RUNTIME_DIR_ENV, sandbox.runtime_root())
            .arg("probe")
            .arg(tether_bin())
            .assert()
            .success()
    };

    probe().stdout(predicate::str::diff("not running\n"));

    let mut run = spawn_run(&sandbox, &[]);
    wait_for_pids(&sandbox.pid_file(), 1, Duration::from_secs(10));
    probe().stdout(predicate::str::diff("running\n"));

    kill(run.id(), Signal::SIGINT);
    assert!(run.wait().expect("wait for run").success());
    probe().stdout(predicate::str::diff("not running\n"));
}

#[test]
fn interrupting_run_stops_the_child_gracefully() {
    let sandbox = Sandbox::new();
    let mut run = spawn_run(&sandbox, &["--stop-timeout", "5s"]);
    let child_pid = wait_for_pids(&sandbox.pid_file(), 1, Duration::from_secs(10))[0];

    kill(run.id(), Signal::SIGINT);
    let status = run.wait().expect("wait for run");

    assert!(status.success());
    wait_for_file_value(&sandbox.exit_file(), "termination-requested");
    assert!(!is_process_alive(child_pid));
}

#[test]
fn duplicate_run_exits_without_spawning() {
    let sandbox = Sandbox::new();
    let mut first = spawn_run(&sandbox, &[]);
    wait_for_pids(&sandbox.pid_file(), 1, Duration::from_secs(10));

    let bin = tether_bin();
    Command::new(assert_cmd::cargo::cargo_bin!("tether"))
        .env(RUNTIME_DIR_ENV, sandbox.runtime_root())
        .args(["run", "--"])
        .arg(&bin)
        .arg("child")
        .assert()
        .success()
        .stderr(predicate::str::contains("already running"));

    kill(first.id(), Signal::SIGINT);
    assert!(first.wait().expect("wait for run").success());
}

#[test]
fn run_reads_the_child_from_a_config_file() {
    let sandbox = Sandbox::new();
    let config_path = sandbox.path().join("tether.yaml");
    std::fs::write(
        &config_path,
        format!(
            r#"options:
  restart_on_exit: false
child:
  program: {bin}
  args: ["child", "--pid-file", "{pids}", "--exit-file", "{exit}"]
startup_timeout: 10s
stop_timeout: 5s
"#,
            bin = tether_bin().display(),
            pids = sandbox.pid_file().display(),
            exit = sandbox.exit_file().display(),
        ),
    )
    .expect("write config");

    let mut run = StdCommand::new(tether_bin())
        .env(RUNTIME_DIR_ENV, sandbox.runtime_root())
        .arg("run")
        .arg("--config")
        .arg(&config_path)
        .stdin(Stdio::null())
        .spawn()
        .expect("spawn tether run");
    let child_pid = wait_for_pids(&sandbox.pid_file(), 1, Duration::from_secs(10))[0];

    // without restarts, run returns on its own once the child is gone
    kill(child_pid, Signal::SIGKILL);
    wait_until("run to exit", Duration::from_secs(5), || {
        run.try_wait().expect("poll run").is_some()
    });
}
