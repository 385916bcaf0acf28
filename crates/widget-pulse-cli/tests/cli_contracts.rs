#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;
use widget_pulse_store_sqlite::seed_legacy_profile_slots;

fn wp_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_wp") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/wp");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "widget-pulse-cli", "--bin", "wp"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build wp binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn wp_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(wp_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run wp command {:?}: {err}", args),
    }
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

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("wp-cli-test-{}.sqlite3", Ulid::new()))
}

fn cleanup(db_path: &Path) {
    let _ = std::fs::remove_file(db_path);
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(wp_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["register", "status", "feedback", "reset", "catalog"] {
        assert!(
            stdout.contains(required),
            "help output is missing subcommand {required}"
        );
    }
}

#[test]
fn register_then_status_round_trip() {
    let db = temp_db_path();

    let output = wp_output(&db, &["register", "--name", "지민", "--grade", "고2"]);
    assert!(output.status.success(), "register failed: {output:?}");
    let record = stdout_json(&output);
    let user_id = match record["user_id"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("register output missing user_id: {record}"),
    };
    assert!(!user_id.is_empty());
    assert_eq!(record["name"], "지민");
    assert_eq!(record["grade"], "고2");
    assert_eq!(record["phone"], "");

    let output = wp_output(&db, &["status"]);
    assert!(output.status.success());
    let status = stdout_json(&output);
    assert_eq!(status["registered"], Value::Bool(true));
    assert_eq!(status["record"]["user_id"], Value::String(user_id));

    cleanup(&db);
}

#[test]
fn status_on_fresh_database_reports_unregistered() {
    let db = temp_db_path();

    let output = wp_output(&db, &["status"]);
    assert!(output.status.success());
    let status = stdout_json(&output);
    assert_eq!(status["registered"], Value::Bool(false));
    assert!(status.get("record").is_none());

    cleanup(&db);
}

#[test]
fn feedback_without_registration_is_a_hard_stop() {
    let db = temp_db_path();

    let output = wp_output(
        &db,
        &[
            "feedback",
            "--widget",
            "math-helper",
            "--frequency",
            "매일",
            "--helpfulness",
            "도움됨",
            "--need",
            "필요",
        ],
    );
    assert!(
        !output.status.success(),
        "feedback must fail before registration"
    );

    cleanup(&db);
}

#[test]
fn feedback_with_missing_answer_is_rejected_locally() {
    let db = temp_db_path();

    let output = wp_output(&db, &["register", "--name", "지민", "--grade", "고2"]);
    assert!(output.status.success());

    let output = wp_output(
        &db,
        &[
            "feedback",
            "--widget",
            "math-helper",
            "--frequency",
            "매일",
            "--helpfulness",
            "",
            "--need",
            "필요",
        ],
    );
    assert!(!output.status.success());

    cleanup(&db);
}

#[test]
fn feedback_without_endpoint_settles_as_transport_failure() {
    let db = temp_db_path();

    let output = wp_output(&db, &["register", "--name", "지민", "--grade", "고2"]);
    assert!(output.status.success());

    let output = wp_output(
        &db,
        &[
            "feedback",
            "--widget",
            "math-helper",
            "--frequency",
            "매일",
            "--helpfulness",
            "도움됨",
            "--need",
            "필요",
        ],
    );
    // The settle is observable but not a process failure.
    assert!(output.status.success(), "feedback did not settle: {output:?}");
    let outcome = stdout_json(&output);
    assert_eq!(outcome["outcome"], "transport_failed");

    cleanup(&db);
}

#[test]
fn reset_clears_the_identity() {
    let db = temp_db_path();

    let output = wp_output(&db, &["register", "--name", "지민", "--grade", "고2"]);
    assert!(output.status.success());

    let output = wp_output(&db, &["reset"]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["reset"], Value::Bool(true));

    let output = wp_output(&db, &["status"]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["registered"], Value::Bool(false));

    cleanup(&db);
}

#[test]
fn catalog_resolution_contract() {
    let db = temp_db_path();

    let output = wp_output(&db, &["catalog", "resolve", "math-helper"]);
    assert!(output.status.success());
    let resolved = stdout_json(&output);
    assert_eq!(resolved["numeric_id"], 101);
    assert_eq!(resolved["title"], "수학풀이 도우미");
    assert_eq!(resolved["category"], "math");

    let output = wp_output(&db, &["catalog", "resolve", "nonexistent-widget"]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["numeric_id"], 9999);

    let output = wp_output(&db, &["catalog", "list", "--category", "english"]);
    assert!(output.status.success());
    let listed = stdout_json(&output);
    assert_eq!(listed.as_array().map(Vec::len), Some(5));

    let output = wp_output(&db, &["catalog", "list", "--category", "music"]);
    assert!(!output.status.success());

    cleanup(&db);
}

#[test]
fn legacy_slots_are_migrated_on_first_status() {
    let db = temp_db_path();

    // Create the schema, then seed the field-scattered legacy shape an
    // older script revision would have left behind.
    let output = wp_output(&db, &["status"]);
    assert!(output.status.success());

    {
        let conn = match Connection::open(&db) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to open seeded db: {err}"),
        };
        if let Err(err) = seed_legacy_profile_slots(&conn, "지민", "고2", None) {
            panic!("failed to seed legacy slots: {err}");
        }
    }

    let output = wp_output(&db, &["status"]);
    assert!(output.status.success());
    let status = stdout_json(&output);
    assert_eq!(status["registered"], Value::Bool(true));
    let migrated_id = match status["record"]["user_id"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("migrated record missing user_id: {status}"),
    };
    assert!(!migrated_id.is_empty());

    // Idempotent: the upgraded record is durable.
    let output = wp_output(&db, &["status"]);
    let status = stdout_json(&output);
    assert_eq!(status["record"]["user_id"], Value::String(migrated_id));

    cleanup(&db);
}
