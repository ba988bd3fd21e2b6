//! End-to-end tests for `recon run` and friends
//!
//! Both sides are read from fixture directories and the run store is kept in
//! memory, so these tests need neither a database nor a CRM.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn volunteer(i: usize) -> Value {
    json!({
        "Id": format!("0035e00000VOL{i:05}"),
        "FirstName": format!("First{i}"),
        "LastName": format!("Last{i}"),
        "Email": format!("volunteer{i}@example.org"),
        "Title": "Engineer",
        "Department": "Outreach",
        "AccountId": "0015e00000ORG00001",
        "Volunteer_Hours__c": 12.5,
        "Last_Volunteer_Date__c": "2024-03-01",
        "HasOptedOutOfEmail": false,
        "LastModifiedDate": "2024-03-02T08:00:00.000+0000"
    })
}

fn write_records(dir: &Path, entity: &str, records: &[Value]) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(format!("{entity}.json")), serde_json::to_string(records).unwrap()).unwrap();
}

/// Fixture directories with `source` CRM volunteers and `local` mirrored ones
fn fixtures(source: usize, local: usize) -> TempDir {
    let dir = TempDir::new().unwrap();
    write_records(&dir.path().join("crm"), "volunteer", &(0..source).map(volunteer).collect::<Vec<_>>());
    write_records(&dir.path().join("local"), "volunteer", &(0..local).map(volunteer).collect::<Vec<_>>());
    dir
}

/// `recon` with a clean environment, reading fixtures from `dir`
fn recon(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("recon").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("DATABASE_URL")
        .env_remove("RECON_CRM_URL")
        .env_remove("RECON_CONFIG")
        .env_remove("RECON_ALERT_WEBHOOK")
        .env("RECON_RETRY_INITIAL_BACKOFF_MS", "1");
    cmd
}

fn run_with_fixtures(dir: &TempDir) -> Command {
    let mut cmd = recon(dir);
    cmd.args(["run", "--entity", "volunteer", "--source-dir"])
        .arg(dir.path().join("crm"))
        .arg("--local-dir")
        .arg(dir.path().join("local"));
    cmd
}

// ============================================================================
// Exit codes
// ============================================================================

#[test]
fn test_clean_run_exits_zero() {
    let dir = fixtures(10, 10);

    run_with_fixtures(&dir)
        .assert()
        .code(0)
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("3 passed"));
}

#[test]
fn test_clean_slow_run_exits_zero() {
    let dir = fixtures(10, 10);

    run_with_fixtures(&dir)
        .args(["--mode", "slow"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("5 passed"));
}

#[test]
fn test_missing_local_records_exit_one() {
    let dir = fixtures(10, 7);

    run_with_fixtures(&dir)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("partial_failure"))
        .stdout(predicate::str::contains("count_variance"));
}

#[test]
fn test_json_output() {
    let dir = fixtures(10, 7);

    let output = run_with_fixtures(&dir).args(["--json", "--mode", "slow"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));

    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["summary"]["status"], "partial_failure");
    assert_eq!(report["summary"]["triggered_by"], "manual");
    assert_eq!(report["results"].as_array().unwrap().len(), 5);

    let hash = report["results"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["check_type"] == "hash")
        .unwrap();
    assert_eq!(hash["metrics"]["missing_in_local"], 3.0);
}

#[test]
fn test_policy_file_relaxes_threshold() {
    let dir = fixtures(10, 9);
    let policy = dir.path().join("recon.toml");
    fs::write(&policy, "[defaults]\ncount_threshold = 0.2\n").unwrap();

    run_with_fixtures(&dir).arg("--config").arg(&policy).assert().code(0);
}

// ============================================================================
// Operational failures
// ============================================================================

#[test]
fn test_missing_database_exits_two() {
    let dir = fixtures(1, 1);

    recon(&dir)
        .args(["run", "--entity", "volunteer", "--source-dir"])
        .arg(dir.path().join("crm"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("DATABASE_URL"));
}

#[test]
fn test_missing_crm_source_exits_two() {
    let dir = fixtures(1, 1);

    recon(&dir)
        .args(["run", "--entity", "volunteer", "--local-dir"])
        .arg(dir.path().join("local"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("CRM"));
}

#[test]
fn test_invalid_policy_exits_two() {
    let dir = fixtures(1, 1);
    let policy = dir.path().join("recon.toml");
    fs::write(&policy, "[defaults]\ncount_threshold = -1.0\n").unwrap();

    run_with_fixtures(&dir)
        .arg("--config")
        .arg(&policy)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_unknown_entity_is_rejected() {
    let dir = fixtures(1, 1);

    recon(&dir)
        .args(["run", "--entity", "donor", "--local-dir", "x", "--source-dir", "y"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("donor"));
}

#[test]
fn test_show_requires_database() {
    let dir = TempDir::new().unwrap();

    recon(&dir)
        .args(["show", "8f14e45f-ceea-467f-a0f8-2f5a4c1c6b1e"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("DATABASE_URL"));
}

#[test]
fn test_markdown_help() {
    let dir = TempDir::new().unwrap();

    recon(&dir)
        .arg("--markdown-help")
        .assert()
        .success()
        .stdout(predicate::str::contains("recon run"));
}

// ============================================================================
// Alerts
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_partial_failure_posts_alert() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hooks/recon"))
        .and(body_partial_json(json!({"summary": {"status": "partial_failure"}})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = fixtures(10, 5);
    run_with_fixtures(&dir)
        .env("RECON_ALERT_WEBHOOK", format!("{}/hooks/recon", mock_server.uri()))
        .assert()
        .code(1);
}
