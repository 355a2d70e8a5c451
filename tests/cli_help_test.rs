use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_every_command() {
    let mut cmd = Command::cargo_bin("fleet-kernel").unwrap();

    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("decide"));
}

#[test]
fn decide_prints_a_scale_up_decision() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("fleet-kernel").unwrap();

    cmd.current_dir(dir.path())
        .env("RUST_LOG", "off")
        .args(["decide", "--queue-depth", "45", "--current-agents", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"action\": \"scale_up\""))
        .stdout(predicate::str::contains("\"to_count\": 3"));
}

#[test]
fn config_init_writes_a_loadable_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet-kernel.toml");
    let mut cmd = Command::cargo_bin("fleet-kernel").unwrap();

    cmd.current_dir(dir.path())
        .env("RUST_LOG", "off")
        .args(["config", "init", "--path"])
        .arg(&path)
        .assert()
        .success();

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("[health]"));

    Command::cargo_bin("fleet-kernel")
        .unwrap()
        .current_dir(dir.path())
        .env("RUST_LOG", "off")
        .args(["config", "init", "--path"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
}
