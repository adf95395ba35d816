use super::*;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_without_environment() {
    let cfg = EngineConfig::from_lookup(|_| None).unwrap();
    assert_eq!(cfg.base_dir, PathBuf::from("data"));
    assert_eq!(cfg.log_dir, PathBuf::from("data").join("log"));
    assert_eq!(cfg.worker_count, 1);
    assert_eq!(cfg.sync_mode, SyncMode::SyncWrite);
    assert!(cfg.checkpoint_interval.is_none());
    assert!(cfg.replication.is_none());
}

#[test]
fn overrides_are_parsed() {
    let cfg = EngineConfig::from_lookup(lookup_from(&[
        ("TIDEDB_BASE_DIR", "/tmp/tide"),
        ("TIDEDB_WORKERS", "4"),
        ("TIDEDB_MAX_QUEUE", "64"),
        ("TIDEDB_SYNC_MODE", "pseudo_sync"),
        ("TIDEDB_PSEUDO_SYNC_MS", "50"),
        ("TIDEDB_CHECKPOINT_SECS", "30"),
    ]))
    .unwrap();

    assert_eq!(cfg.base_dir, PathBuf::from("/tmp/tide"));
    assert_eq!(cfg.worker_count, 4);
    assert_eq!(cfg.max_queue_len, 64);
    assert_eq!(cfg.sync_mode, SyncMode::PseudoSync { wait_ms: 50 });
    assert_eq!(cfg.checkpoint_interval, Some(Duration::from_secs(30)));
}

#[test]
fn garbage_number_is_rejected() {
    let err = EngineConfig::from_lookup(lookup_from(&[("TIDEDB_WORKERS", "many")])).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { .. }));
}

#[test]
fn unknown_sync_mode_is_rejected() {
    assert!("sometimes".parse::<SyncMode>().is_err());
    assert_eq!("ASYNC".parse::<SyncMode>().unwrap(), SyncMode::Async);
}

#[test]
fn master_with_slaves_from_env() {
    let cfg = EngineConfig::from_lookup(lookup_from(&[
        ("TIDEDB_ROLE", "master"),
        ("TIDEDB_LOCAL_ADDR", "m:1"),
        ("TIDEDB_SLAVES", "s1:1, s2:1"),
        ("TIDEDB_SYNC_N", "2"),
    ]))
    .unwrap();
    let repl = cfg.replication.unwrap();
    assert_eq!(repl.role, Role::Master);
    assert_eq!(repl.slaves, vec!["s1:1".to_string(), "s2:1".to_string()]);
    assert_eq!(repl.sync_n, 2);
}

#[test]
fn quorum_larger_than_slave_set_is_invalid() {
    let repl = ReplicationConfig::master("m", vec!["s1".into()], 2);
    assert!(repl.validate().is_err());
}

#[test]
fn slave_requires_master_address() {
    let err = EngineConfig::from_lookup(lookup_from(&[("TIDEDB_ROLE", "slave")])).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn pseudo_sync_interval_must_be_positive() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = EngineConfig::new(dir.path()).with_sync_mode(SyncMode::PseudoSync { wait_ms: 0 });
    assert!(cfg.validate().is_err());
}
