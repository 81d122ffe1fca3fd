use assert_cmd::prelude::*;
use predicates::str::contains;
use std::process::Command;

fn dbcmp() -> Command {
    let mut cmd = Command::cargo_bin("dbcmp").unwrap();
    cmd.env_remove("DBCMP_BACKENDS").env_remove("RUST_LOG");
    cmd
}

// `dbcmp` with no args should exit with a non-zero code.
#[test]
fn cli_no_args() {
    dbcmp().assert().failure();
}

#[test]
fn cli_version() {
    dbcmp().args(&["-V"]).assert().success();
}

#[test]
fn cli_demo_on_memory() {
    dbcmp()
        .args(&["--backends", "memory", "demo", "memory"])
        .assert()
        .success()
        .stdout(contains("[SYSTEM] [success] memory: 19 people and 4 sectors loaded"))
        .stdout(contains("== aggregate =="))
        .stdout(contains("[MEMORY] [success] 555888999 inserted"))
        .stdout(contains("[MEMORY] [success] 555888999 deleted"));
}

#[test]
fn cli_exec_prints_the_envelope() {
    // a fresh memory backend is empty, so the listing succeeds with no records
    dbcmp()
        .args(&["--backends", "memory", "exec", "list", "memory"])
        .assert()
        .success()
        .stdout(contains("\"data\": []"))
        .stdout(contains("[MEMORY] [success] 0 records found"));
}

#[test]
fn cli_exec_failed_operation_exits_non_zero() {
    dbcmp()
        .args(&["--backends", "memory", "exec", "get", "memory", "--dni", "1"])
        .assert()
        .success()
        .stdout(contains("[MEMORY] [error] 1 not found"));

    dbcmp()
        .args(&["--backends", "memory", "exec", "update", "memory", "--dni", "1"])
        .assert()
        .failure()
        .stdout(contains("\"kind\": \"not_found\""));
}

#[test]
fn cli_invalid_operation() {
    dbcmp()
        .args(&["--backends", "memory", "exec", "drop", "memory"])
        .assert()
        .failure()
        .stderr(contains("as an operation"));
}

#[test]
fn cli_invalid_backend() {
    dbcmp()
        .args(&["exec", "list", "cassandra"])
        .assert()
        .failure()
        .stderr(contains("as a backend"));
}

#[test]
fn cli_invalid_parameter() {
    dbcmp()
        .args(&["--backends", "memory", "exec", "range_query", "memory", "--min-val", "lots"])
        .assert()
        .failure()
        .stderr(contains("min_val=lots as a number"));
}

#[test]
fn cli_ping_memory() {
    dbcmp()
        .args(&["--backends", "memory", "ping"])
        .assert()
        .success()
        .stdout(contains("memory: up"));
}
