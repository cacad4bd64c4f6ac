use std::env;
use std::fs;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use super::load_config;
use super::settings::{BrokerSettings, Settings};
use crate::broker::Broker;
use crate::broker::dispatcher::{DispatcherConfig, ProcessingMode};
use crate::utils::logging;

/// Run `f` with the process cwd set to a fresh temp dir.
fn in_temp_dir<F: FnOnce(&TempDir)>(f: F) {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");
    f(&tmp);
    env::set_current_dir(orig).expect("restore cwd");
}

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.processing_mode, ProcessingMode::Sequential);
    assert_eq!(settings.broker.buffer_threshold, -1);
    assert_eq!(settings.broker.workers, 4);
    assert_eq!(settings.broker.batch_size, 256);
    assert_eq!(settings.broker.idle_interval_ms, 50);
    assert_eq!(settings.logging.level, "info");
}

#[test]
fn test_processing_mode_parses_case_insensitively() {
    assert_eq!(
        "Parallel".parse::<ProcessingMode>(),
        Ok(ProcessingMode::Parallel)
    );
    assert_eq!(
        " SEQUENTIAL ".parse::<ProcessingMode>(),
        Ok(ProcessingMode::Sequential)
    );
    assert!("round-robin".parse::<ProcessingMode>().is_err());
}

#[test]
fn test_dispatcher_config_from_settings() {
    let settings = BrokerSettings {
        processing_mode: ProcessingMode::Parallel,
        buffer_threshold: -7,
        workers: 0,
        batch_size: 10,
        idle_interval_ms: 5,
    };
    let config = DispatcherConfig::from(&settings);
    assert_eq!(config.processing_mode, ProcessingMode::Parallel);
    assert_eq!(config.buffer_threshold, -1);
    assert_eq!(config.workers, 1);
    assert_eq!(config.batch_size, 10);
    assert_eq!(config.idle_interval, Duration::from_millis(5));
    assert_eq!(config.worker_count(), 1);
}

#[test]
#[serial]
fn load_config_without_sources_uses_defaults() {
    in_temp_dir(|_| {
        let cfg = load_config().expect("load_config failed");
        assert_eq!(cfg, Settings::default());
    });
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    in_temp_dir(|_| {
        fs::create_dir_all("config").expect("create config dir");
        let toml = r#"
            [broker]
            processing_mode = "Parallel"
            buffer_threshold = 100
            workers = 8

            [logging]
            level = "debug"
        "#;
        fs::write("config/default.toml", toml).expect("write config file");

        let cfg = load_config().expect("load_config failed");
        assert_eq!(cfg.broker.processing_mode, ProcessingMode::Parallel);
        assert_eq!(cfg.broker.buffer_threshold, 100);
        assert_eq!(cfg.broker.workers, 8);
        assert_eq!(cfg.broker.batch_size, 256);
        assert_eq!(cfg.logging.level, "debug");
    });
}

#[test]
#[serial]
fn load_config_normalizes_negative_threshold() {
    in_temp_dir(|_| {
        fs::create_dir_all("config").expect("create config dir");
        fs::write("config/default.toml", "[broker]\nbuffer_threshold = -20\n")
            .expect("write config file");

        let cfg = load_config().expect("load_config failed");
        assert_eq!(cfg.broker.buffer_threshold, -1);
    });
}

#[test]
#[serial]
fn load_config_env_overrides_file() {
    in_temp_dir(|_| {
        fs::create_dir_all("config").expect("create config dir");
        fs::write("config/default.toml", "[broker]\nbuffer_threshold = 10\n")
            .expect("write config file");

        temp_env::with_vars(
            [
                ("SERVICEBUS__BROKER__BUFFER_THRESHOLD", Some("5")),
                ("SERVICEBUS__BROKER__PROCESSING_MODE", Some("parallel")),
            ],
            || {
                let cfg = load_config().expect("load_config failed");
                assert_eq!(cfg.broker.buffer_threshold, 5);
                assert_eq!(cfg.broker.processing_mode, ProcessingMode::Parallel);
            },
        );
    });
}

#[test]
#[serial]
fn load_config_rejects_unknown_processing_mode() {
    in_temp_dir(|_| {
        fs::create_dir_all("config").expect("create config dir");
        fs::write("config/default.toml", "[broker]\nprocessing_mode = \"fifo\"\n")
            .expect("write config file");

        assert!(load_config().is_err());
    });
}

#[test]
#[serial]
fn loaded_settings_configure_broker_and_logging() {
    in_temp_dir(|_| {
        fs::create_dir_all("config").expect("create config dir");
        let toml = r#"
            [broker]
            processing_mode = "parallel"
            buffer_threshold = 25
            workers = 3
            batch_size = 16
            idle_interval_ms = 20

            [logging]
            level = "warn"
        "#;
        fs::write("config/default.toml", toml).expect("write config file");

        let cfg = load_config().expect("load_config failed");
        logging::init(&cfg.logging.level);
        let broker = Broker::from_settings(&cfg.broker);

        let config = broker.dispatcher().config();
        assert_eq!(config.processing_mode, ProcessingMode::Parallel);
        assert_eq!(config.buffer_threshold, 25);
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.idle_interval, Duration::from_millis(20));
        assert!(broker.status().contains("Buffer threshold: 25"));
        assert!(!broker.is_running());
    });
}
