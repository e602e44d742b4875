//! Configuration loading and the negative startup paths: a config the
//! engine cannot trust must fail before anything runs.

use std::sync::Arc;

use tempfile::TempDir;

use sheetsync::config::SyncConfig;
use sheetsync::error::ErrorKind;
use sheetsync::sheet::mock::MockSheetClient;
use sheetsync::Engine;

#[test]
fn skeleton_writes_and_loads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sheetsync.json");

    SyncConfig::write_skeleton(&path).unwrap();
    let config = SyncConfig::load(&path).unwrap();
    assert_eq!(config.pairs.len(), 1);
    assert_eq!(config.pairs[0].name(), "MyDB:users");
    assert_eq!(config.window_s, 10);
    assert_eq!(config.batch_size, 10);
}

#[test]
fn skeleton_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sheetsync.json");
    SyncConfig::write_skeleton(&path).unwrap();
    assert!(SyncConfig::write_skeleton(&path).is_err());
}

#[test]
fn missing_file_is_a_config_error() {
    let err = SyncConfig::load(std::path::Path::new("/nonexistent/config.json")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
}

#[test]
fn unmapped_key_field_fails_startup() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sheetsync.json");

    let mut config = SyncConfig::skeleton();
    config.pairs[0].key_field = "not_a_column".into();
    std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

    let err = SyncConfig::load(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(err.to_string().contains("key_field"));
}

#[test]
fn window_out_of_bounds_fails_startup() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sheetsync.json");

    let mut config = SyncConfig::skeleton();
    config.window_s = 600;
    std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

    assert!(SyncConfig::load(&path).is_err());
}

#[test]
fn malformed_json_fails_startup() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sheetsync.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = SyncConfig::load(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
}

#[test]
fn engine_builds_from_valid_config() {
    let dir = TempDir::new().unwrap();
    let mut config = SyncConfig::skeleton();
    config.snapshot_dir = dir.path().join("snapshots");
    Engine::with_sheet_client(config, Arc::new(MockSheetClient::new())).unwrap();
}

#[test]
fn engine_rejects_bad_window() {
    let dir = TempDir::new().unwrap();
    let mut config = SyncConfig::skeleton();
    config.snapshot_dir = dir.path().join("snapshots");
    config.window_s = 1;
    let err =
        Engine::with_sheet_client(config, Arc::new(MockSheetClient::new())).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn defaults_fill_omitted_keys() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sheetsync.json");

    // Only the required keys
    let minimal = serde_json::json!({
        "db_url": "mysql://sync:x@127.0.0.1:3306/appdb",
        "sheet": { "base_url": "https://sheet.example.com/api", "token": "t" },
        "pairs": [{
            "sheet_db": "MyDB",
            "sheet_table": "users",
            "db_table": "users",
            "key_field": "employee_id",
            "field_map": [
                { "sheet": "Employee ID", "db": "employee_id" }
            ]
        }]
    });
    std::fs::write(&path, minimal.to_string()).unwrap();

    let config = SyncConfig::load(&path).unwrap();
    assert_eq!(config.poll_interval_s, 5);
    assert_eq!(config.window_s, 10);
    assert_eq!(config.retry_max, 3);
    assert_eq!(config.rate_limit_qps, 10);
    assert_eq!(config.consumer_workers, 4);
    assert_eq!(config.pairs[0].updated_at_column, "updated_at");
}
