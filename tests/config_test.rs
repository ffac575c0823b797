//! Integration tests for configuration loading

use campus_watch::domain::incident::ChannelKind;
use campus_watch::infra::Config;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "north-campus"

[aggregator]
min_confidence = 0.6
max_match_distance = 0.05
lost_timeout_ms = 8000
window_capacity = 48
min_window_samples = 10

[incident]
anomaly_threshold = 0.8
min_dwell_ms = 6000
cooldown_ms = 120000
dedup_bucket_ms = 60000

[validator]
lookup_timeout_ms = 250

[dispatcher]
max_attempts = 3
backoff_base_ms = 1000
backoff_cap_ms = 10000
send_timeout_ms = 1500
channels = [
    { kind = "sms", recipient = "+15551234567" },
    { kind = "email", recipient = "security@north.example" },
    { kind = "push", recipient = "ops-room" },
]

[anonymizer]
retention_ms = 86400000
interval_ms = 600000
pseudonym_salt = "north-salt"

[pipeline]
scoring_workers = 8

[metrics]
interval_secs = 30
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "north-campus");
    assert_eq!(config.min_confidence(), 0.6);
    assert_eq!(config.max_match_distance(), 0.05);
    assert_eq!(config.lost_timeout_ms(), 8000);
    assert_eq!(config.window_capacity(), 48);
    assert_eq!(config.min_window_samples(), 10);
    assert_eq!(config.anomaly_threshold(), 0.8);
    assert_eq!(config.min_dwell_ms(), 6000);
    assert_eq!(config.cooldown_ms(), 120_000);
    assert_eq!(config.dedup_bucket_ms(), 60_000);
    assert_eq!(config.lookup_timeout().as_millis(), 250);
    assert_eq!(config.max_attempts(), 3);
    assert_eq!(config.backoff_base().as_millis(), 1000);
    assert_eq!(config.backoff_cap().as_millis(), 10_000);
    assert_eq!(config.send_timeout().as_millis(), 1500);
    assert_eq!(config.retention_ms(), 86_400_000);
    assert_eq!(config.pseudonym_salt(), "north-salt");
    assert_eq!(config.scoring_workers(), 8);
    assert_eq!(config.metrics_interval_secs(), 30);

    let channels = config.channels();
    assert_eq!(channels.len(), 3);
    assert_eq!(channels[0].kind, ChannelKind::Sms);
    assert_eq!(channels[0].recipient, "+15551234567");
    assert_eq!(channels[2].kind, ChannelKind::Push);
}

#[test]
fn test_partial_config_uses_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file
        .write_all(
            br#"
[site]
id = "east-wing"

[incident]
anomaly_threshold = 0.75
"#,
        )
        .unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();
    assert_eq!(config.site_id(), "east-wing");
    assert_eq!(config.anomaly_threshold(), 0.75);
    // Everything unspecified falls back to defaults
    assert_eq!(config.min_dwell_ms(), 4000);
    assert_eq!(config.cooldown_ms(), 300_000);
    assert_eq!(config.max_attempts(), 5);
    assert!(!config.channels().is_empty());
}

#[test]
fn test_invalid_threshold_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file
        .write_all(
            br#"
[incident]
anomaly_threshold = 1.5
"#,
        )
        .unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(err.to_string().contains("anomaly_threshold"));
}

#[test]
fn test_empty_channels_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file
        .write_all(
            br#"
[dispatcher]
channels = []
"#,
        )
        .unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_missing_file_is_fatal() {
    assert!(Config::from_file("/nonexistent/path.toml").is_err());
}
