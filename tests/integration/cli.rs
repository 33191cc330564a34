#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    process::{Child, Command as StdCommand, Stdio},
    time::Duration,
};

use assert_cmd::Command;
use common::{wait_for_path, wait_for_process_exit, wait_until};
use predicates::prelude::*;
use tempfile::tempdir;

fn toolboxd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("toolboxd"))
}

struct SupervisorGuard(Child);

impl Drop for SupervisorGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn help_lists_the_commands() {
    toolboxd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("toolboxd"))
        .stdout(predicate::str::contains("reload"))
        .stdout(predicate::str::contains("--type"));
}

#[test]
fn commands_fail_cleanly_without_a_supervisor() {
    let temp = tempdir().unwrap();
    let state = temp.path().join("state");

    toolboxd()
        .args(["status", "--state-dir"])
        .arg(&state)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not running"));

    // A stale socket file must not be mistaken for a live supervisor.
    fs::create_dir_all(&state).unwrap();
    drop(std::os::unix::net::UnixListener::bind(state.join("control.sock")).unwrap());
    toolboxd()
        .args(["stop", "frpserver.", "--state-dir"])
        .arg(&state)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not running"));
    assert!(!state.join("control.sock").exists());
}

#[test]
fn unknown_worker_type_is_rejected() {
    toolboxd()
        .args(["--type", "gopher", "--subconfig", "/nonexistent.json"])
        .assert()
        .failure();
}

#[test]
fn worker_exits_at_end_of_input() {
    let temp = tempdir().unwrap();
    let subconfig = temp.path().join("ftpserver.json");
    fs::write(&subconfig, r#"{"port": 2121}"#).unwrap();

    toolboxd()
        .args(["--type", "ftpserver", "--subconfig"])
        .arg(&subconfig)
        .write_stdin("reload\n")
        .timeout(Duration::from_secs(10))
        .assert()
        .success();
}

#[test]
fn supervisor_serves_control_commands() {
    let temp = tempdir().unwrap();
    let state = temp.path().join("state");
    let config = temp.path().join("toolboxd.yaml");
    fs::write(
        &config,
        r#"version: "1"
services:
  webfront:
    settings:
      listen: ":8443"
  frpserver:
    program: sleep
    args: ["30"]
    instances:
      - id: 1
        settings:
          bindPort: 7001
"#,
    )
    .unwrap();

    let child = StdCommand::new(assert_cmd::cargo::cargo_bin!("toolboxd"))
        .args(["run", "--config"])
        .arg(&config)
        .arg("--state-dir")
        .arg(&state)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let supervisor_pid = child.id();
    let _guard = SupervisorGuard(child);

    wait_for_path(&state.join("control.sock"));
    wait_for_path(&state.join("conf/webfront.json"));
    wait_for_path(&state.join("pid/frpserver/1.pid"));

    let status = || {
        toolboxd()
            .args(["status", "--json", "--state-dir"])
            .arg(&state)
            .output()
            .unwrap()
    };
    assert!(wait_until(Duration::from_secs(5), || {
        let out = status();
        let text = String::from_utf8_lossy(&out.stdout);
        out.status.success() && text.contains("webfront") && text.contains("frpserver.1")
    }));

    toolboxd()
        .args(["reload", "webfront", "--state-dir"])
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains("reload 'webfront' done"));

    toolboxd()
        .args(["stop", "frpserver.", "--state-dir"])
        .arg(&state)
        .assert()
        .success();
    assert!(wait_until(Duration::from_secs(5), || !state
        .join("pid/frpserver/1.pid")
        .exists()));

    toolboxd()
        .args(["shutdown", "--state-dir"])
        .arg(&state)
        .assert()
        .success()
        .stdout(predicate::str::contains("shutting down"));
    wait_for_process_exit(supervisor_pid);
    assert!(!state.join("control.sock").exists());
}
