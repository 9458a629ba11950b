//! Tests for the kp binary

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write_config(dir: &Path, per_window: u64) -> PathBuf {
    let path = dir.join("keypace.yml");
    let yaml = format!(
        "replica-id: cli-test
store:
  path: {store}
queue:
  path: {queue}
rate:
  per-window: {per_window}
  min-interval-ms: 20
lock:
  lease-ttl-ms: 1000
  poll-interval-ms: 10
scheduler:
  poll-interval-ms: 10
executor:
  log-path: {log}
",
        store = dir.join("store.db").display(),
        queue = dir.join("queue.db").display(),
        log = dir.join("completions.jsonl").display(),
        per_window = per_window,
    );
    fs::write(&path, yaml).unwrap();
    path
}

fn kp(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("kp").unwrap();
    cmd.arg("--config").arg(config).arg("--log-stderr");
    cmd
}

#[test]
fn test_submit_reports_json_results() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), 2);

    kp(&config)
        .args(["submit", "123", "--count", "3", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"{"result":"admitted"}"#).count(2))
        .stdout(predicate::str::contains(r#""result":"admitted_delayed""#).count(1));

    kp(&config)
        .args(["status", "123", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""window_count": 3"#));
}

#[test]
fn test_submit_rejects_invalid_key() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), 2);

    kp(&config)
        .args(["submit", "has space"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("rejected"));

    kp(&config)
        .arg("queue")
        .assert()
        .success()
        .stdout(predicate::str::contains("Ready:    0"));
}

#[test]
fn test_run_then_log() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), 20);

    kp(&config)
        .args(["run", "abc", "-n", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 completed"));

    kp(&config)
        .args(["log", "--key", "abc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("abc").count(3));
}

#[test]
fn test_bad_config_fails() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bad.yml");
    fs::write(&path, "rate:\n  per-window: 0\n").unwrap();

    kp(&path).args(["submit", "123"]).assert().failure();
}
