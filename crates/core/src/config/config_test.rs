use std::io::Write;

use super::models::*;

#[test]
fn test_default_config_is_valid() {
    let config = AppConfig::default();
    config.validate().unwrap();
    assert_eq!(config.scheduler.max_workers, 4);
    assert_eq!(config.store.backend, StoreBackend::Memory);
    assert!(config.registry.jobs.is_empty());
}

#[test]
fn test_from_toml_with_partial_sections() {
    let config = AppConfig::from_toml(
        r#"
        [scheduler]
        max_workers = 2

        [monitor]
        stale_threshold_seconds = 60

        [[registry.jobs]]
        source_system = "crm"
        operation = "contacts"
        job_ref = "crm_contacts_v2"
        "#,
    )
    .unwrap();

    assert_eq!(config.scheduler.max_workers, 2);
    assert_eq!(config.scheduler.key_prefix, "datasync:scheduler");
    assert_eq!(config.monitor.stale_threshold_seconds, 60);
    assert_eq!(config.monitor.sweep_interval_seconds, 3);
    assert_eq!(config.registry.jobs.len(), 1);
    assert_eq!(config.registry.jobs[0].job_ref, "crm_contacts_v2");
}

#[test]
fn test_invalid_values_rejected() {
    assert!(AppConfig::from_toml("[scheduler]\nmax_workers = 0\n").is_err());
    assert!(AppConfig::from_toml("[observability]\nlog_format = \"xml\"\n").is_err());
    assert!(AppConfig::from_toml(
        "[store]\nbackend = \"redis\"\nredis_url = \"http://localhost\"\n"
    )
    .is_err());
}

#[test]
fn test_heartbeat_must_be_shorter_than_stale_threshold() {
    let err = AppConfig::from_toml(
        r#"
        [monitor]
        stale_threshold_seconds = 10

        [pipeline]
        heartbeat_interval_seconds = 10
        "#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("心跳间隔"));
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        "[scheduler]\nmax_workers = 7\n\n[database]\nbackend = \"memory\"\n"
    )
    .unwrap();

    let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
    assert_eq!(config.scheduler.max_workers, 7);
    assert_eq!(config.database.backend, DatabaseBackend::Memory);
}

#[test]
fn test_load_missing_file_fails() {
    assert!(AppConfig::load(Some("/nonexistent/datasync.toml")).is_err());
}

#[test]
fn test_toml_roundtrip_preserves_registry() {
    let mut config = AppConfig::default();
    config.registry.jobs.push(RegistryEntry {
        source_system: "erp".to_string(),
        operation: "orders".to_string(),
        job_ref: "erp_orders".to_string(),
    });
    let text = config.to_toml().unwrap();
    let parsed = AppConfig::from_toml(&text).unwrap();
    assert_eq!(parsed.registry.jobs, config.registry.jobs);
}
