#![allow(clippy::unwrap_used)]

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_exits_clean() {
    Command::cargo_bin("sable")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--permission-mode"))
        .stdout(predicate::str::contains("--sandbox-type"))
        .stdout(predicate::str::contains("--compact-watermark"));
}

#[test]
fn missing_workspace_is_a_fatal_error() {
    Command::cargo_bin("sable")
        .unwrap()
        .args(["/definitely/not/a/real/workspace", "--input", "hi"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn rejects_unknown_permission_mode() {
    Command::cargo_bin("sable")
        .unwrap()
        .args(["--permission-mode", "yolo"])
        .assert()
        .failure();
}
