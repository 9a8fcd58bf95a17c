//! CLI integration tests driven through the compiled binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn orc() -> Command {
    Command::cargo_bin("orc").unwrap()
}

#[test]
fn init_creates_config_file() {
    let dir = tempfile::tempdir().unwrap();
    orc()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();

    assert!(dir.path().join(".orc/config.toml").exists());
}

#[test]
fn config_prints_resolved_toml() {
    let dir = tempfile::tempdir().unwrap();
    orc()
        .current_dir(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("default_target_branch"));
}

#[test]
fn new_task_then_status_shows_created() {
    let dir = tempfile::tempdir().unwrap();

    let output = orc()
        .current_dir(dir.path())
        .args(["new", "Add widget", "--description", "build a widget"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(output).unwrap();
    let task_id = stdout.trim().strip_prefix("created task ").unwrap().to_string();

    orc()
        .current_dir(dir.path())
        .args(["status", &task_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));
}

#[test]
fn status_on_unknown_task_fails() {
    let dir = tempfile::tempdir().unwrap();
    orc()
        .current_dir(dir.path())
        .args(["status", "T-does-not-exist"])
        .assert()
        .failure();
}

#[test]
fn show_missing_artifact_reports_absence() {
    let dir = tempfile::tempdir().unwrap();

    let output = orc()
        .current_dir(dir.path())
        .args(["new", "Add widget"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(output).unwrap();
    let task_id = stdout.trim().strip_prefix("created task ").unwrap().to_string();

    orc()
        .current_dir(dir.path())
        .args(["show", &task_id, "specify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no artifact recorded"));
}

#[test]
fn new_task_rejects_unknown_weight() {
    let dir = tempfile::tempdir().unwrap();
    orc()
        .current_dir(dir.path())
        .args(["new", "Add widget", "--weight", "huge"])
        .assert()
        .failure();
}
