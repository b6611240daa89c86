use super::settings::Settings;
use super::{load_config, load_config_from};

use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "0.0.0.0");
    assert_eq!(settings.server.nt4_port, 5810);
    assert_eq!(settings.server.nt3_port, 1735);
    assert_eq!(settings.server.tick_ms, 5);
    assert_eq!(settings.storage.persistent_file, "networktables.json");
    assert_eq!(settings.storage.save_interval_ms, 1000);
    assert_eq!(settings.logging.level, "info");
    assert_eq!(settings.server.nt4_addr(), "0.0.0.0:5810");
    assert_eq!(settings.server.nt3_addr(), "0.0.0.0:1735");
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    temp_env::with_vars_unset(
        ["NTSERVE_SERVER__NT4_PORT", "NTSERVE_LOGGING__LEVEL"],
        || {
            let cfg = load_config_from("does/not/exist").expect("load_config failed");
            assert_eq!(cfg.server.nt4_port, 5810);
            assert_eq!(cfg.logging.level, "info");
        },
    );
}

#[test]
#[serial]
fn test_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("ntserve.toml");
    let toml = r#"
        [server]
        host = "127.0.0.1"
        nt3_port = 11735

        [storage]
        persistent_file = "/tmp/nt.json"
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg.server.host, "127.0.0.1");
    assert_eq!(cfg.server.nt3_port, 11735);
    // untouched keys keep their defaults
    assert_eq!(cfg.server.nt4_port, 5810);
    assert_eq!(cfg.storage.persistent_file, "/tmp/nt.json");
    assert_eq!(cfg.storage.save_interval_ms, 1000);
}

#[test]
#[serial]
fn test_env_overrides_defaults() {
    temp_env::with_vars(
        [
            ("NTSERVE_SERVER__NT4_PORT", Some("15810")),
            ("NTSERVE_STORAGE__SAVE_INTERVAL_MS", Some("250")),
            ("NTSERVE_LOGGING__LEVEL", Some("debug")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.server.nt4_port, 15810);
            assert_eq!(cfg.storage.save_interval_ms, 250);
            assert_eq!(cfg.logging.level, "debug");
            assert_eq!(cfg.server.nt3_port, 1735);
        },
    );
}
