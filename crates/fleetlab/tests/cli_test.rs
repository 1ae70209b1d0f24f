#![allow(deprecated)] // TODO: move from cargo_bin to the cargo_bin_cmd! macro

use assert_cmd::Command;
use predicates::prelude::*;

fn fleetlab() -> Command {
    let mut cmd = Command::cargo_bin("fleetlab").unwrap();
    cmd.env_remove("FLEETLAB_CONFIG_PATH")
        .env_remove("FLEETLAB_BACKEND")
        .env_remove("RUST_LOG");
    cmd
}

/// Top-level help lists every command group
#[test]
fn test_cli_help() {
    fleetlab()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("inventory"))
        .stdout(predicate::str::contains("cluster"))
        .stdout(predicate::str::contains("client"))
        .stdout(predicate::str::contains("attach"))
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("expiry"))
        .stdout(predicate::str::contains("template"));
}

#[test]
fn test_cli_version() {
    fleetlab()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("fleetlab"));
}

#[test]
fn test_cluster_create_help() {
    fleetlab()
        .args(["cluster", "create", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--count"))
        .stdout(predicate::str::contains("--expire"))
        .stdout(predicate::str::contains("--instance-type"));
}

#[test]
fn test_expiry_help() {
    fleetlab()
        .args(["expiry", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("install"))
        .stdout(predicate::str::contains("frequency"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_invalid_command() {
    fleetlab().arg("invalid-command").assert().failure();
}

/// A bad selector is rejected while parsing arguments, before any backend is contacted
#[test]
fn test_invalid_selector() {
    fleetlab()
        .args(["exec", "-n", "mydc", "-l", "1,x", "--", "uptime"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid node selector token 'x'"));
}

#[test]
fn test_zero_node_selector() {
    fleetlab()
        .args(["cluster", "stop", "-n", "mydc", "-l", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("node numbers start at 1"));
}

#[test]
fn test_invalid_group_name() {
    fleetlab()
        .args(["cluster", "destroy", "-n", "bad name!"])
        .assert()
        .failure();
}

#[test]
fn test_exec_requires_command() {
    fleetlab()
        .args(["exec", "-n", "mydc"])
        .assert()
        .failure();
}

#[test]
fn test_unknown_backend() {
    let dir = tempfile::tempdir().unwrap();
    fleetlab()
        .current_dir(dir.path())
        .env("FLEETLAB_BACKEND", "azure")
        .arg("inventory")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown backend type 'azure'"));
}

#[test]
fn test_invalid_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("fleetlab.yaml");
    std::fs::write(&config, "defaults:\n  parallel_threads: 0\n").unwrap();

    fleetlab()
        .current_dir(dir.path())
        .arg("inventory")
        .assert()
        .failure()
        .stderr(predicate::str::contains("parallel_threads must be at least 1"));
}

#[test]
fn test_files_download_help() {
    fleetlab()
        .args(["files", "download", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("LOCAL/<node>/"))
        .stdout(predicate::str::contains("--nodes"));
}
