use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

fn actd(state: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("actd"));
    cmd.env_remove("ACTD_CONTROL")
        .env_remove("ACTD_ADMIN_TOKEN")
        .arg("--state-dir")
        .arg(state);
    cmd
}

fn start_daemon(state: &Path) -> Child {
    let child = actd(state)
        .arg("run")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn daemon");
    let socket = state.join("control.sock");
    for _ in 0..200 {
        if socket.exists() {
            return child;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("daemon never created {}", socket.display());
}

fn stdout_json(cmd: &mut Command) -> serde_json::Value {
    let assert = cmd.arg("--json").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&output).expect("json");
    json["data"].clone()
}

#[test]
fn help_lists_commands() {
    Command::new(assert_cmd::cargo::cargo_bin!("actd"))
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("activate")
                .and(predicate::str::contains("group"))
                .and(predicate::str::contains("--state-dir")),
        );
}

#[test]
fn status_without_daemon_fails() {
    let tmp = TempDir::new().expect("tmpdir");
    actd(tmp.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no daemon reachable"));
}

#[test]
fn registrations_survive_daemon_restart() {
    let tmp = TempDir::new().expect("tmpdir");
    let state = tmp.path();
    let mut daemon = start_daemon(state);

    let group = stdout_json(actd(state).args(["group", "register"]));
    let group = group.as_str().expect("group id").to_string();
    let object = stdout_json(actd(state).args([
        "object", "register", "--group", group.as_str(), "--class", "Echo", "--restart",
    ]));
    let object = object.as_str().expect("object id").to_string();

    let status = stdout_json(actd(state).arg("status"));
    assert_eq!(status["objects"], 1);
    assert_eq!(status["groups"][0]["group"], group.as_str());

    // No group executable is installed, so activation fails cleanly.
    actd(state)
        .args(["activate", object.as_str()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("activation_failed"));

    actd(state).arg("stop").assert().success();
    assert!(daemon.wait().expect("daemon exit").success());

    let mut daemon = start_daemon(state);
    let desc = stdout_json(actd(state).args(["object", "show", object.as_str()]));
    assert_eq!(desc["class_name"], "Echo");
    assert_eq!(desc["restart"], true);

    actd(state).args(["group", "unregister", group.as_str()]).assert().success();
    actd(state)
        .args(["object", "show", object.as_str()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown_object"));

    actd(state).arg("stop").assert().success();
    assert!(daemon.wait().expect("daemon exit").success());
}
