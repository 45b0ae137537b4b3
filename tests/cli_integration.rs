use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;

fn make_town(root: &Path) {
    fs::create_dir_all(root.join("settings")).unwrap();
    fs::write(root.join("settings/agents.json"), r#"{"version": 1}"#).unwrap();
}

#[test]
fn prime_outside_town_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("boomtown").unwrap();
    cmd.arg("prime").current_dir(tmp.path());
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("not inside a town"));
}

#[test]
fn prime_emits_mayor_context_at_town_root() {
    let tmp = tempfile::tempdir().unwrap();
    make_town(tmp.path());
    let mut cmd = Command::cargo_bin("boomtown").unwrap();
    cmd.arg("prime").current_dir(tmp.path());
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("# Mayor Context"));
}

#[test]
fn prime_refuses_identity_collision() {
    let tmp = tempfile::tempdir().unwrap();
    make_town(tmp.path());
    let worker = tmp.path().join("gastown/polecats/furiosa/.runtime");
    fs::create_dir_all(&worker).unwrap();
    // PID 1 is alive and is never the test process
    fs::write(
        worker.join("agent.lock"),
        r#"{"pid": 1, "acquired_at": "2026-01-01T00:00:00Z", "session_id": "tmux-0", "hostname": "host"}"#,
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("boomtown").unwrap();
    cmd.arg("prime").current_dir(worker.parent().unwrap());
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("IDENTITY COLLISION"));
}

#[test]
fn callbacks_with_empty_inbox() {
    let tmp = tempfile::tempdir().unwrap();
    make_town(tmp.path());
    let mut cmd = Command::cargo_bin("boomtown").unwrap();
    cmd.args(["callbacks", "--dry-run"]).current_dir(tmp.path());
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("No pending callbacks"));
}

#[test]
fn mail_send_and_inbox_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    make_town(tmp.path());

    let mut send = Command::cargo_bin("boomtown").unwrap();
    send.args([
        "mail", "send", "mayor/",
        "--subject", "HELP: keys missing",
        "--priority", "high",
        "--from", "gastown/furiosa",
    ])
    .current_dir(tmp.path());
    send.assert().success();

    let mut inbox = Command::cargo_bin("boomtown").unwrap();
    inbox
        .args(["mail", "inbox", "--agent", "mayor/"])
        .current_dir(tmp.path());
    inbox
        .assert()
        .success()
        .stdout(predicate::str::contains("HELP: keys missing"));
}

#[test]
fn doctor_clean_reports_count() {
    let tmp = tempfile::tempdir().unwrap();
    make_town(tmp.path());
    let mut cmd = Command::cargo_bin("boomtown").unwrap();
    cmd.args(["doctor", "clean"]).current_dir(tmp.path());
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Cleaned 0 stale lock(s)"));
}

#[test]
fn schema_prints_merge_queue_fields() {
    let mut cmd = Command::cargo_bin("boomtown").unwrap();
    cmd.arg("schema");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("retry_flaky_tests"))
        .stdout(predicate::str::contains("on_conflict"));
}

#[test]
fn queue_submit_requires_town() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("boomtown").unwrap();
    cmd.args([
        "queue", "submit", "gastown",
        "--branch", "polecat/furiosa",
        "--worker", "furiosa",
    ])
    .current_dir(tmp.path());
    cmd.assert().failure();
}
