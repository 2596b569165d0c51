use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use geo_mirror::config::{Config, ConfigLoader, RetryEntry};
use geo_mirror::error::MirrorError;

#[test]
fn parse_config_overrides() {
    let config = Config {
        schema_version: Some(1),
        root: Some("/data/geo".to_string()),
        archive_url: Some("ftp://ftp.ncbi.nlm.nih.gov".to_string()),
        ntp_server: None,
        workers: Some(8),
        connection: Some(RetryEntry {
            retries: Some(5),
            interval_ms: Some(250),
        }),
        file: None,
        task_timeout_secs: Some(120),
        http_timeout_secs: None,
        metadata_pattern: None,
        member_patterns: Some(Vec::new()),
    };

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.root.as_str(), "/data/geo");
    assert_eq!(resolved.workers, 8);
    assert_eq!(resolved.connection_retry.retries, 5);
    assert_eq!(resolved.connection_retry.max_attempts(), 6);
    assert_eq!(resolved.connection_retry.interval, Duration::from_millis(250));
    assert_eq!(resolved.file_retry.retries, 3);
    assert_eq!(resolved.task_timeout, Duration::from_secs(120));
    assert_eq!(resolved.ntp_server, "time.nist.gov:123");
    assert!(resolved.is_member_file("GSM1_anything.txt.gz"));
}

#[test]
fn load_config_from_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("geo-mirror.json");
    fs::write(
        &path,
        r#"{ "root": "mirror", "member_patterns": ["\\.idat"], "file": { "interval_ms": 5 } }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.root.as_str(), "mirror");
    assert_eq!(resolved.file_retry.interval, Duration::from_millis(5));
    assert!(resolved.is_member_file("GSM1_R01C01_Red.IDAT.gz"));
    assert!(!resolved.is_member_file("GSM1_table.txt"));
}

#[test]
fn explicit_missing_file_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(MirrorError::ConfigRead(_))
    );
}

#[test]
fn bad_pattern_is_a_parse_error() {
    let config = Config {
        metadata_pattern: Some("family(".to_string()),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(MirrorError::ConfigParse(_))
    );
}

#[test]
fn newer_schema_version_is_rejected() {
    let config: Config = serde_json::from_str(r#"{ "schema_version": 2 }"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(MirrorError::ConfigParse(message)) if message.contains("schema_version 2")
    );
}
