use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn nl2kql_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("nl2kql");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    fs::write(
        root.join("snapshot.json"),
        r#"{
            "tables": [{
                "name": "SecurityEvent",
                "columns": [
                    {"name": "TimeGenerated", "type": "datetime"},
                    {"name": "EventID", "type": "int"},
                    {"name": "Account", "type": "string"},
                    {"name": "Computer", "type": "string"}
                ],
                "samples": {"EventID": [4624, 4625]}
            }]
        }"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/nl2kql.sqlite"

[embedding]
provider = "hash"
dims = 64

[generation]
provider = "disabled"

[server]
bind = "127.0.0.1:7341"
"#,
        root.display()
    );

    let config_path = config_dir.join("nl2kql.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_nl2kql(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = nl2kql_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run nl2kql binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_nl2kql(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(stdout.contains("seeded examples: 5"));
    assert!(tmp.path().join("data/nl2kql.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_nl2kql(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (stdout, _, success2) = run_nl2kql(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
    assert!(!stdout.contains("seeded examples"));

    let (stdout, _, _) = run_nl2kql(&config_path, &["status", "--json"]);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["total_items"], 5);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_nl2kql(&tmp.path().join("nope.toml"), &["status"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_ingest_snapshot() {
    let (tmp, config_path) = setup_test_env();
    let snapshot = tmp.path().join("snapshot.json");

    let (stdout, stderr, success) =
        run_nl2kql(&config_path, &["ingest", snapshot.to_str().unwrap()]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("tables: 1"));
    assert!(stdout.contains("field descriptions: 4"));
    assert!(stdout.contains("value sets: 1"));
    assert!(stdout.contains("ok"));

    // Rebuilding is idempotent.
    run_nl2kql(&config_path, &["ingest", snapshot.to_str().unwrap()]);
    let (stdout, _, _) = run_nl2kql(&config_path, &["status", "--json"]);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["total_items"], 6);
}

#[test]
fn test_validate_with_builtin_tables() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_nl2kql(
        &config_path,
        &["validate", "SecurityEvent | where TimeGenerated > ago(1h) | take 5"],
    );
    assert!(success, "validate failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("valid: true"));
    assert!(stdout.contains("| take 5"));
}

#[test]
fn test_validate_corrects_against_ingested_schema() {
    let (tmp, config_path) = setup_test_env();
    let snapshot = tmp.path().join("snapshot.json");
    run_nl2kql(&config_path, &["ingest", snapshot.to_str().unwrap()]);

    let (stdout, stderr, success) = run_nl2kql(
        &config_path,
        &[
            "validate",
            "--json",
            "SecurityEventz | where TimeGenerated > ago(1d) | where eventid == 4625",
        ],
    );
    assert!(success, "validate failed: stdout={}, stderr={}", stdout, stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["is_valid"], true);
    let corrected = report["corrected"].as_str().unwrap();
    assert!(corrected.starts_with("SecurityEvent\n"));
    assert!(corrected.contains("EventID == 4625"));
}

#[test]
fn test_feedback_adds_example() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_nl2kql(
        &config_path,
        &[
            "feedback",
            "--question",
            "failed logins by computer",
            "--generated",
            "SecurityEvent | where EventID == 4625 | summarize count() by Computer",
            "--rating",
            "good",
        ],
    );
    assert!(success, "feedback failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("feedback recorded"));
    assert!(stdout.contains("used 1 times"));

    let (stdout, _, _) = run_nl2kql(&config_path, &["status", "--json"]);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["feedback_records"], 1);
    assert_eq!(status["total_items"], 1);
}

#[test]
fn test_feedback_rejects_unknown_rating() {
    let (_tmp, config_path) = setup_test_env();
    let (_, _, success) = run_nl2kql(
        &config_path,
        &[
            "feedback",
            "--question",
            "q",
            "--generated",
            "Perf",
            "--rating",
            "meh",
        ],
    );
    assert!(!success);
}

#[test]
fn test_status_text() {
    let (_tmp, config_path) = setup_test_env();
    run_nl2kql(&config_path, &["init"]);

    let (stdout, stderr, success) = run_nl2kql(&config_path, &["status"]);
    assert!(success, "status failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("ground_truth_pairs"));
    assert!(stdout.contains("total items: 5"));
    assert!(stdout.contains("embedding: hash-fallback-v1@64"));
    assert!(stdout.contains("generation: disabled"));
}

#[test]
fn test_ask_without_generator_is_structured_error() {
    let (_tmp, config_path) = setup_test_env();
    run_nl2kql(&config_path, &["init"]);

    let (stdout, stderr, success) =
        run_nl2kql(&config_path, &["ask", "show failed logins from the last day"]);
    assert!(!success, "ask should fail without a generator: {}", stdout);
    assert!(stderr.contains("query generation unavailable"));
}
