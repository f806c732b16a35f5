use std::io::Write;

use flowmill_core::config::EngineConfig;
use flowmill_core::FlowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
workers = 8
queue_capacity = 32
event_capacity = 64
handler_timeout_secs = 5

[retry]
max_retries = 5
initial_backoff_ms = 50
max_backoff_ms = 1000

[overdue]
enabled = false
interval_secs = 15

[store]
path = "/var/lib/flowmill/engine.db"

[groups]
finance = ["alice", "bob"]
legal = ["carol"]
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.workers, 8);
    assert_eq!(config.engine.queue_capacity, 32);
    assert_eq!(config.engine.event_capacity, 64);
    assert_eq!(config.engine.handler_timeout_secs, 5);
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.initial_backoff_ms, 50);
    assert_eq!(config.retry.max_backoff_ms, 1000);
    assert!(!config.overdue.enabled);
    assert_eq!(config.overdue.interval_secs, 15);
    assert_eq!(
        config.store_path(),
        std::path::PathBuf::from("/var/lib/flowmill/engine.db")
    );
    assert_eq!(config.groups["finance"], vec!["alice", "bob"]);
    assert_eq!(config.groups["legal"], vec!["carol"]);
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[groups]\nops = [\"dave\"]\n").expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.workers, 4);
    assert_eq!(config.engine.queue_capacity, 256);
    assert_eq!(config.engine.handler_timeout_secs, 30);
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.retry.initial_backoff_ms, 200);
    assert!(config.overdue.enabled);
    assert_eq!(config.overdue.interval_secs, 60);
    assert_eq!(config.store.path, "~/.flowmill/flowmill.db");
    assert_eq!(config.groups["ops"], vec!["dave"]);
}

#[test]
fn test_env_var_expansion_in_store_path() {
    std::env::set_var("FLOWMILL_TEST_DB_DIR", "/srv/flowmill");
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[store]\npath = \"${FLOWMILL_TEST_DB_DIR}/flow.db\"\n")
        .expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");
    std::env::remove_var("FLOWMILL_TEST_DB_DIR");

    assert_eq!(config.store.path, "/srv/flowmill/flow.db");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let missing = dir.path().join("absent.toml");

    let err = EngineConfig::load(&missing).unwrap_err();
    assert!(matches!(err, FlowError::ConfigNotFound(_)));
    assert_eq!(err.kind(), "config");

    let fallback = EngineConfig::load_or_default(&missing).expect("defaults");
    assert_eq!(fallback.engine.workers, 4);
}

#[test]
fn test_invalid_toml_is_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nworkers = ").expect("write toml");

    let err = EngineConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, FlowError::Config(_)));
}

#[test]
fn test_zero_workers_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\nworkers = 0\n").expect("write toml");

    let err = EngineConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, FlowError::Config(ref m) if m.contains("workers")));
}

#[test]
fn test_config_roundtrips_through_toml() {
    let mut config = EngineConfig::default();
    config.groups.insert("finance".into(), vec!["alice".into()]);
    config.retry.max_retries = 7;

    let rendered = toml::to_string_pretty(&config).expect("serialize");
    let parsed: EngineConfig = toml::from_str(&rendered).expect("parse");

    assert_eq!(parsed.retry.max_retries, 7);
    assert_eq!(parsed.groups["finance"], vec!["alice"]);
}
