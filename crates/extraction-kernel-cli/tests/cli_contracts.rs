#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

const HEAD: &str = "0e7dd198b7c7";

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ek-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn ek(args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_ek"));
    command
        .env_remove("EK_DB")
        .env_remove("EK_TRUST_BOUNDARY")
        .env_remove("EK_LOCK_WAIT_MS")
        .env_remove("EK_LOG")
        .env("RUST_LOG", "warn")
        .current_dir(std::env::temp_dir())
        .args(args);

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run ek {:?}: {err}", args),
    }
}

fn ek_db(db_path: &Path, args: &[&str]) -> Output {
    let mut full = vec!["--db", db_path.to_str().unwrap_or("")];
    full.extend_from_slice(args);
    ek(&full)
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn cleanup(db_path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db_path.as_os_str().to_owned();
        path.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(path));
    }
}

#[test]
fn help_lists_command_groups() {
    let output = ek(&["--help"]);
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["migrate", "policy", "status", "docs"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain {required}; output={stdout}"
        );
    }

    let output = ek(&["migrate", "--help"]);
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["up", "down", "current", "history", "heads", "plan", "check", "unlock"] {
        assert!(stdout.contains(required), "missing {required}; output={stdout}");
    }
}

#[test]
fn upgrade_reports_skipped_policies_and_records_the_head() {
    let db_path = temp_db("up");

    let output = ek_db(&db_path, &["migrate", "up"]);
    assert_success(&output);
    let report = stdout_json(&output);
    assert_eq!(report["to"], Value::String(HEAD.to_string()));
    assert_eq!(report["applied"].as_array().map(Vec::len), Some(5));
    assert_eq!(report["skipped"].as_array().map(Vec::len), Some(2));
    assert_eq!(
        report["skipped"][0]["reason"],
        Value::String("no_trust_boundary".to_string())
    );

    let current = stdout_json(&ek_db(&db_path, &["migrate", "current"]));
    assert_eq!(current["head"], Value::String(HEAD.to_string()));
    assert_eq!(current["is_latest"], Value::Bool(true));

    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open migrated db: {err}"),
    };
    let logged: i64 = match conn.query_row("SELECT COUNT(*) FROM schema_revision_log", [], |row| {
        row.get(0)
    }) {
        Ok(value) => value,
        Err(err) => panic!("failed to count log rows: {err}"),
    };
    assert_eq!(logged, 5);
    drop(conn);

    cleanup(&db_path);
}

#[test]
fn trust_boundary_flag_protects_tables() {
    let db_path = temp_db("policy");

    let output = ek_db(&db_path, &["--trust-boundary", "migrate", "up"]);
    assert_success(&output);
    assert_eq!(stdout_json(&output)["skipped"].as_array().map(Vec::len), Some(0));

    let status = stdout_json(&ek_db(&db_path, &["policy", "status"]));
    let tables: Vec<&str> = status["protected_tables"]
        .as_array()
        .map(|tables| tables.iter().filter_map(|table| table["table"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(tables, vec!["extractions", "user"]);

    cleanup(&db_path);
}

#[test]
fn downgrade_to_base_clears_the_head() {
    let db_path = temp_db("down");
    assert_success(&ek_db(&db_path, &["migrate", "up"]));

    let output = ek_db(&db_path, &["migrate", "down", "--to", "base"]);
    assert_success(&output);
    let report = stdout_json(&output);
    assert_eq!(report["to"], Value::Null);
    assert_eq!(report["applied"][0]["direction"], Value::String("down".to_string()));

    let current = stdout_json(&ek_db(&db_path, &["migrate", "current"]));
    assert_eq!(current["head"], Value::Null);

    let history = stdout_json(&ek_db(&db_path, &["migrate", "history"]));
    assert_eq!(history.as_array().map(Vec::len), Some(10));

    cleanup(&db_path);
}

#[test]
fn upgrade_and_downgrade_refuse_walks_the_other_way() {
    let db_path = temp_db("direction");
    assert_success(&ek_db(&db_path, &["migrate", "up"]));

    let backwards = ek_db(&db_path, &["migrate", "up", "--to", "20038a3ab258"]);
    assert!(!backwards.status.success());
    let stderr = String::from_utf8_lossy(&backwards.stderr);
    assert!(stderr.contains("error[wrong_direction]"), "stderr={stderr}");

    let current = stdout_json(&ek_db(&db_path, &["migrate", "current"]));
    assert_eq!(current["head"], Value::String(HEAD.to_string()));
    assert_eq!(
        stdout_json(&ek_db(&db_path, &["migrate", "history"])).as_array().map(Vec::len),
        Some(5)
    );

    assert_success(&ek_db(&db_path, &["migrate", "down", "--to", "efc9ab8c3122"]));
    let forwards = ek_db(&db_path, &["migrate", "down", "--to", HEAD]);
    assert!(!forwards.status.success());
    let stderr = String::from_utf8_lossy(&forwards.stderr);
    assert!(stderr.contains("error[wrong_direction]"), "stderr={stderr}");
    let current = stdout_json(&ek_db(&db_path, &["migrate", "current"]));
    assert_eq!(current["head"], Value::String("efc9ab8c3122".to_string()));

    cleanup(&db_path);
}

#[test]
fn unknown_revision_target_fails_with_a_stable_kind() {
    let db_path = temp_db("unknown");
    let output = ek_db(&db_path, &["migrate", "up", "--to", "ffffffffffff"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error[unknown_revision]") && stderr.contains("ffffffffffff"),
        "unexpected stderr={stderr}"
    );
    cleanup(&db_path);
}

#[test]
fn plan_is_a_dry_run() {
    let db_path = temp_db("plan");
    let output = ek_db(&db_path, &["migrate", "plan", "--to", "efc9ab8c3122"]);
    assert_success(&output);
    let plan = stdout_json(&output);
    assert_eq!(plan["nodes"].as_array().map(Vec::len), Some(2));
    assert_eq!(plan["nodes"][1]["revision"], Value::String("efc9ab8c3122".to_string()));

    let current = stdout_json(&ek_db(&db_path, &["migrate", "current"]));
    assert_eq!(current["head"], Value::Null);
    cleanup(&db_path);
}

#[test]
fn audit_and_heads_describe_the_builtin_revisions() {
    let db_path = temp_db("check");
    let output = ek_db(&db_path, &["migrate", "check"]);
    assert_success(&output);
    assert_eq!(stdout_json(&output)["head"], Value::String(HEAD.to_string()));

    let heads = stdout_json(&ek_db(&db_path, &["migrate", "heads"]));
    assert_eq!(heads.as_array().map(Vec::len), Some(1));
    cleanup(&db_path);
}

#[test]
fn stale_lock_requires_force() {
    let db_path = temp_db("lock");
    assert_success(&ek_db(&db_path, &["migrate", "current"]));

    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open db: {err}"),
    };
    if let Err(err) = conn.execute(
        "INSERT INTO schema_migration_lock(singleton, holder, acquired_at) VALUES (1, 'crashed-run', '2026-01-01T00:00:00Z')",
        [],
    ) {
        panic!("failed to plant lock: {err}");
    }
    drop(conn);

    let blocked = ek_db(&db_path, &["migrate", "up"]);
    assert!(!blocked.status.success());
    let stderr = String::from_utf8_lossy(&blocked.stderr);
    assert!(stderr.contains("error[lock_held]") && stderr.contains("crashed-run"), "stderr={stderr}");

    assert!(!ek_db(&db_path, &["migrate", "unlock"]).status.success());
    let released = ek_db(&db_path, &["migrate", "unlock", "--force"]);
    assert_success(&released);
    assert_eq!(
        stdout_json(&released)["released"]["holder"],
        Value::String("crashed-run".to_string())
    );
    assert_success(&ek_db(&db_path, &["migrate", "up"]));
    cleanup(&db_path);
}

#[test]
fn status_validation_enforces_the_state_machine() {
    let legal = ek(&["status", "validate", "UPLOADED", "OCR_IN_PROGRESS"]);
    assert_success(&legal);
    assert_eq!(stdout_json(&legal)["legal"], Value::Bool(true));

    let to_failed = ek(&["status", "validate", "APPROVED", "FAILED"]);
    assert_success(&to_failed);

    let illegal = ek(&["status", "validate", "UPLOADED", "APPROVED"]);
    assert!(!illegal.status.success());
    let stderr = String::from_utf8_lossy(&illegal.stderr);
    assert!(stderr.contains("error[illegal_transition]"), "stderr={stderr}");

    let unknown = ek(&["status", "validate", "UPLOADED", "DONE"]);
    assert!(String::from_utf8_lossy(&unknown.stderr).contains("error[unknown_status]"));

    let graph = stdout_json(&ek(&["status", "graph"]));
    assert_eq!(graph["states"].as_array().map(Vec::len), Some(12));
}

#[test]
fn docs_check_flags_reversal_instructions() {
    let root = std::env::temp_dir().join(format!("ek-docs-{}", Ulid::new()));
    let nested = root.join("runbooks");
    if let Err(err) = std::fs::create_dir_all(&nested) {
        panic!("failed to create docs tree: {err}");
    }
    let root_arg = root.to_str().unwrap_or("").to_string();

    if let Err(err) = std::fs::write(root.join("README.md"), "# Deploy\n\nRun `ek migrate up`.\n") {
        panic!("failed to write doc: {err}");
    }
    assert_success(&ek(&["docs", "check", "--root", &root_arg]));

    if let Err(err) = std::fs::write(nested.join("rollback.md"), "To undo, run `ek migrate down --to base`.\n") {
        panic!("failed to write doc: {err}");
    }
    let output = ek(&["docs", "check", "--root", &root_arg]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[docs_violation]"), "stderr={stderr}");
    assert_eq!(stdout_json(&output)["violations"][0]["line"], Value::Number(1_u64.into()));

    let missing = root.join("absent");
    assert_success(&ek(&["docs", "check", "--root", missing.to_str().unwrap_or("")]));

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn invalid_configuration_is_rejected_before_running() {
    let config = std::env::temp_dir().join(format!("ek-config-{}.toml", Ulid::new()));
    if let Err(err) = std::fs::write(&config, "[database]\nbusy_timeout_ms = 0\n") {
        panic!("failed to write config: {err}");
    }
    let output = ek(&["--config", config.to_str().unwrap_or(""), "status", "graph"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[config_invalid]"), "stderr={stderr}");
    let _ = std::fs::remove_file(&config);
}
