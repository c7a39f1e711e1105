//! Publishing configuration from the environment

use publish_server::publishing::PublishConfig;
use serial_test::serial;
use std::env;
use std::path::PathBuf;

const VARS: &[&str] = &[
    "PUBLISH_TMP_DIR",
    "PUBLISH_HARVEST_URL",
    "PUBLISH_PROPAGATION_WINDOW",
    "PUBLISH_MAX_ATTEMPTS",
    "PUBLISH_KEEP_FILES",
];

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_config_from_env() {
    clear_env();
    env::set_var("PUBLISH_TMP_DIR", "/var/tmp/publishing");
    env::set_var("PUBLISH_HARVEST_URL", "https://harvest.example.org/data");
    env::set_var("PUBLISH_PROPAGATION_WINDOW", "5000");
    env::set_var("PUBLISH_MAX_ATTEMPTS", "4");
    env::set_var("PUBLISH_KEEP_FILES", "true");

    let config = PublishConfig::from_env().expect("Failed to parse config from env");

    assert_eq!(config.tmp_dir, PathBuf::from("/var/tmp/publishing"));
    assert_eq!(config.harvest_url.as_deref(), Some("https://harvest.example.org/data"));
    assert_eq!(config.propagation_window, 5_000);
    assert_eq!(config.max_attempts, 4);
    assert!(config.keep_files);

    clear_env();
}

#[test]
#[serial]
fn test_blank_harvest_url_is_unset() {
    clear_env();
    env::set_var("PUBLISH_HARVEST_URL", "   ");

    let config = PublishConfig::from_env().expect("Failed to parse config from env");
    assert!(config.harvest_url.is_none());

    clear_env();
}

#[test]
#[serial]
fn test_zero_window_is_rejected() {
    clear_env();
    env::set_var("PUBLISH_PROPAGATION_WINDOW", "0");

    let err = PublishConfig::from_env().unwrap_err();
    assert!(err.to_string().contains("PUBLISH_PROPAGATION_WINDOW"));

    clear_env();
}

#[test]
#[serial]
fn test_unparseable_values_fall_back_to_defaults() {
    clear_env();
    env::set_var("PUBLISH_MAX_ATTEMPTS", "lots");

    let config = PublishConfig::from_env().expect("Failed to parse config from env");
    assert_eq!(config.max_attempts, PublishConfig::default().max_attempts);

    clear_env();
}
