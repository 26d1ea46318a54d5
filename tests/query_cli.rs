use std::path::Path;
use std::process::{Command, Output};

fn lodestone(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_lodestone"))
        .args(args)
        .current_dir(dir)
        .env_remove("OPENAI_API_KEY")
        .env_remove("LODESTONE_DB")
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn stdout_json(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn query_on_empty_store_reports_hash_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let output = lodestone(dir.path(), &["query", "anything", "--format", "json"]);
    let json = stdout_json(&output);
    assert_eq!(json, serde_json::json!({ "matches": [], "mode": "hash-fallback" }));
}

#[test]
fn ingest_then_query_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = dir.path().join("corpus");
    std::fs::create_dir_all(&corpus).unwrap();
    std::fs::write(
        corpus.join("ledger.txt"),
        "Ledger reconciliation is part of accounting. Ledger reconciliation helps.",
    )
    .unwrap();
    std::fs::write(corpus.join("travel.md"), "# Travel\n\nBook flights two weeks ahead.").unwrap();

    let ingest = lodestone(
        dir.path(),
        &["ingest", "--project", "demo", "corpus", "--format", "json"],
    );
    let summary = stdout_json(&ingest);
    assert_eq!(summary["documents"], 2);
    assert_eq!(summary["project"], "demo");

    let query = lodestone(
        dir.path(),
        &["query", "ledger reconciliation", "--k", "1", "--project", "demo", "--format", "json"],
    );
    let json = stdout_json(&query);
    let matches = json["matches"].as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["path"], "ledger.txt");
    assert!(matches[0]["snippet"].as_str().unwrap().contains("Ledger reconciliation"));

    let stats = stdout_json(&lodestone(dir.path(), &["stats", "--format", "json"]));
    assert_eq!(stats["documents"], 2);

    let forget = lodestone(dir.path(), &["forget", "ledger.txt"]);
    assert!(forget.status.success());
    let missing = lodestone(dir.path(), &["forget", "ledger.txt"]);
    assert!(!missing.status.success());
}

#[test]
fn db_flag_selects_the_store() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("note.txt"), "Petty cash is counted weekly.").unwrap();

    let ingest = lodestone(
        dir.path(),
        &["ingest", "--project", "ops", "--db", "custom.db", "note.txt"],
    );
    assert!(ingest.status.success(), "{}", String::from_utf8_lossy(&ingest.stderr));
    assert!(dir.path().join("custom.db").exists());
    assert!(!dir.path().join(".lodestone/index.db").exists());
}

#[test]
fn doctor_json_lists_checks() {
    let dir = tempfile::tempdir().unwrap();
    let json = stdout_json(&lodestone(dir.path(), &["doctor", "--format", "json"]));
    let names: Vec<&str> = json["checks"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert!(names.contains(&"config_file"));
    assert!(names.contains(&"store"));
    assert!(names.contains(&"embedding_api_key"));
}
