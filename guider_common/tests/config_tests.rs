//! Config file loading tests.
//!
//! Tests for `GuiderConfig::load()`: full files, partial files falling back
//! to defaults, unknown sections and semantic validation after parsing.

use guider_common::config::{ConfigError, ConfigLoader, GuiderConfig, LogLevel};
use guider_common::shm::names::EquipmentClass;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn write(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("guider.toml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_load_full_config() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        r#"
[shared]
log_level = "debug"
service_name = "guider-server"

[shm]
namespace = "obs1"
wait_timeout_ms = 250
poll_interval_ms = 100
create_if_missing = false
unlink_on_shutdown = false
"#,
    );

    let config = GuiderConfig::load(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.shared.log_level, LogLevel::Debug);
    assert_eq!(config.shared.service_name, "guider-server");
    assert_eq!(config.shm.namespace, "obs1");
    assert_eq!(config.shm.wait_timeout(), Duration::from_millis(250));
    assert_eq!(config.shm.poll_interval(), Duration::from_millis(100));
    assert!(!config.shm.create_if_missing);
    assert!(!config.shm.unlink_on_shutdown);
    assert_eq!(config.shm.names().segment(EquipmentClass::Mount), "/obs1_mounts");
}

#[test]
fn test_empty_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "");

    let config = GuiderConfig::load(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.shared.log_level, LogLevel::Info);
    assert_eq!(config.shm.namespace, "phd2");
    assert_eq!(config.shm.names().option_table(), "/phd2_camera_config");
}

#[test]
fn test_partial_shm_section_keeps_other_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        r#"
[shm]
namespace = "lab"
"#,
    );

    let config = GuiderConfig::load(&path).unwrap();
    assert_eq!(config.shm.namespace, "lab");
    assert_eq!(config.shm.wait_timeout(), Duration::from_secs(1));
    assert!(config.shm.create_if_missing);
}

#[test]
fn test_invalid_namespace_fails_validation() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        r#"
[shm]
namespace = "has-dash"
"#,
    );

    let config = GuiderConfig::load(&path).unwrap();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::ValidationError(msg)) if msg.contains("has-dash")
    ));
}

#[test]
fn test_wrong_type_is_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        r#"
[shm]
wait_timeout_ms = "soon"
"#,
    );

    assert!(matches!(GuiderConfig::load(&path), Err(ConfigError::ParseError(_))));
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let result = GuiderConfig::load(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::FileNotFound)));
}
