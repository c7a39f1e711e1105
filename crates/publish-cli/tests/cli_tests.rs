//! Argument handling of the `publish` binary
//!
//! None of these reach the database.

use assert_cmd::Command;
use predicates::prelude::*;

fn publish() -> Command {
    let mut cmd = Command::cargo_bin("publish").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_no_arguments_prints_help() {
    publish()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_help_lists_commands() {
    publish()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("publish"))
        .stdout(predicate::str::contains("traits"))
        .stdout(predicate::str::contains("load-file"))
        .stdout(predicate::str::contains("update-attributes"))
        .stdout(predicate::str::contains("all-clear"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn test_unknown_entity_is_rejected() {
    publish()
        .args(["load-file", "1", "unicorns", "/tmp/unicorns.tsv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown entity type: unicorns"));
}

#[test]
fn test_from_dir_without_now_is_rejected() {
    publish()
        .args(["publish", "1", "--from-dir", "/tmp/exports"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--now"));
}

#[test]
fn test_resource_id_must_be_numeric() {
    publish()
        .args(["status", "fish"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}
