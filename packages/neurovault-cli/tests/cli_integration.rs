use assert_cmd::Command;
use neurovault::codec::{encode, sample_timestamp_us};
use neurovault::{ChunkStore, Modality, NewChunk, Sample, StorageConfig};
use predicates::prelude::*;
use std::path::Path;
use tempfile::tempdir;

fn neurovault() -> Command {
    let mut cmd = Command::cargo_bin("neurovault").unwrap();
    cmd.env_remove("NEUROVAULT_DB");
    cmd
}

fn eeg_chunk(config: &StorageConfig, session_id: i64, start_us: i64) -> NewChunk {
    let params = config.stream(Modality::Eeg);
    let samples: Vec<Sample> = (0..160)
        .map(|i| {
            Sample::new(
                sample_timestamp_us(start_us, i, params.sample_rate),
                vec![i as f32; params.channel_count],
            )
        })
        .collect();
    let encoded = encode(&samples, params.channel_count, params.sample_rate, params.scale_factor).unwrap();
    NewChunk {
        modality: Modality::Eeg,
        session_id,
        start_time_us: start_us,
        end_time_us: samples[159].timestamp_us,
        sample_count: encoded.sample_count,
        channel_count: params.channel_count as u8,
        encoding_version: encoded.version,
        quality_summary: encoded.quality_summary,
        blob: encoded.blob,
    }
}

/// Two sessions: session 1 ended with three chunks, session 2 active with one.
fn seed_store(path: &Path) {
    let config = StorageConfig::default();
    let store = ChunkStore::open(path, &config).unwrap();
    let patient = store.create_patient("patient-001").unwrap();

    let old = store.create_session(patient.id, 0).unwrap();
    store.activate_session(old.id).unwrap();
    for second in 0..3 {
        store.insert_chunk(&eeg_chunk(&config, old.id, second * 1_000_000)).unwrap();
    }

    let current = store.create_session(patient.id, 10_000_000).unwrap();
    store.activate_session(current.id).unwrap();
    store.insert_chunk(&eeg_chunk(&config, current.id, 10_000_000)).unwrap();
}

// =============================================================================
// GENERAL
// =============================================================================

#[test]
fn test_no_args_shows_help() {
    neurovault()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_version_flag() {
    neurovault()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("neurovault"));
}

#[test]
fn test_missing_db_flag_is_rejected() {
    neurovault()
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--db"));
}

// =============================================================================
// STATUS / SESSIONS / CHUNKS
// =============================================================================

#[test]
fn test_status_creates_empty_store() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("fresh.db");

    let output = neurovault()
        .args(["status", "--json", "--db"])
        .arg(&db)
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed["total_bytes"], 0);
    assert_eq!(parsed["eeg_chunks"], 0);
    assert!(parsed["active_session"].is_null());
    assert!(db.exists());
}

#[test]
fn test_status_reports_seeded_store() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("store.db");
    seed_store(&db);

    neurovault()
        .args(["status", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("Chunks: 4 EEG, 0 NIRS"))
        .stdout(predicate::str::contains("Active session: 2"));
}

#[test]
fn test_sessions_json() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("store.db");
    seed_store(&db);

    let output = neurovault()
        .args(["sessions", "--json", "--db"])
        .arg(&db)
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let sessions = parsed.as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    let eeg_counts: Vec<u64> = sessions
        .iter()
        .map(|s| s["eeg_chunks"].as_u64().unwrap())
        .collect();
    assert!(eeg_counts.contains(&3));
    assert!(eeg_counts.contains(&1));
}

#[test]
fn test_chunks_time_range() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("store.db");
    seed_store(&db);

    let output = neurovault()
        .args(["chunks", "--json", "--session", "1", "--start-us", "1000000", "--end-us", "2000000", "--db"])
        .arg(&db)
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let starts: Vec<i64> = parsed
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["start_time_us"].as_i64().unwrap())
        .collect();
    assert_eq!(starts, vec![1_000_000]);
}

// =============================================================================
// MAINTENANCE
// =============================================================================

#[test]
fn test_verify_clean_store() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("store.db");
    seed_store(&db);

    neurovault()
        .args(["verify", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("Verified 4 chunk(s), 640 sample(s)"));
}

#[test]
fn test_verify_reports_corrupt_chunk() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("store.db");
    seed_store(&db);
    {
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute("UPDATE eeg_chunks SET data_blob = X'0902' WHERE id = 2", [])
            .unwrap();
    }

    // Repeated runs report the chunk every time but audit it once.
    for _ in 0..2 {
        neurovault()
            .args(["verify", "--db"])
            .arg(&db)
            .assert()
            .code(3)
            .stdout(predicate::str::contains("CORRUPT eeg chunk 2"));
    }

    neurovault()
        .args(["audit", "--type", "corrupt_chunk", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("CORRUPT_CHUNK"));

    let output = neurovault()
        .args(["audit", "--json", "--type", "CORRUPT_CHUNK", "--db"])
        .arg(&db)
        .assert()
        .success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed.as_array().map(Vec::len), Some(1));
}

#[test]
fn test_cleanup_below_threshold_is_a_no_op() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("store.db");
    seed_store(&db);

    neurovault()
        .args(["cleanup", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to do"));
}

#[test]
fn test_cleanup_with_small_limit_evicts_ended_session() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("store.db");
    seed_store(&db);
    let config = dir.path().join("config.json");
    std::fs::write(&config, r#"{ "cleanup_threshold": 0.5 }"#).unwrap();

    let output = neurovault()
        .args(["cleanup", "--json", "--set-limit", "2000", "--db"])
        .arg(&db)
        .arg("--config")
        .arg(&config)
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed["triggered"], true);
    assert_eq!(parsed["deleted_chunks"], 3);

    neurovault()
        .args(["audit", "--type", "STORAGE_CLEANUP", "--db"])
        .arg(&db)
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("STORAGE_CLEANUP"));
}

#[test]
fn test_stored_limit_survives_plain_open() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("store.db");
    seed_store(&db);
    let config = dir.path().join("config.json");
    std::fs::write(&config, r#"{ "storage_limit_bytes": 9000 }"#).unwrap();

    neurovault()
        .args(["status", "--set-limit", "5000", "--db"])
        .arg(&db)
        .assert()
        .success();

    // Neither the defaults nor a config file override the stored limit.
    for extra in [None, Some(&config)] {
        let mut cmd = neurovault();
        cmd.args(["status", "--json", "--db"]).arg(&db);
        if let Some(path) = extra {
            cmd.arg("--config").arg(path);
        }
        let output = cmd.assert().success();
        let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
        assert_eq!(parsed["limit_bytes"], 5000);
    }

    neurovault()
        .args(["audit", "--json", "--type", "STORAGE_LIMIT_CHANGED", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("5000"));

    neurovault()
        .args(["status", "--set-limit", "0", "--db"])
        .arg(&db)
        .assert()
        .code(2);
}

#[test]
fn test_reconcile_consistent_store() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("store.db");
    seed_store(&db);

    neurovault()
        .args(["reconcile", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("consistent"));
}

#[test]
fn test_audit_rejects_unknown_type() {
    let dir = tempdir().unwrap();
    neurovault()
        .args(["audit", "--type", "nonsense", "--db"])
        .arg(dir.path().join("store.db"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unknown audit event type"));
}
