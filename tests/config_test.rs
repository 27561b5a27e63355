//! Configuration file and environment resolution

use hypnos_core::config::{resolve_config_path, CONFIG_ENV_VAR};
use hypnos_core::{Dependency, HypnosConfig, RhythmType};
use serial_test::serial;
use std::path::PathBuf;
use std::time::Duration;

#[test]
#[serial]
fn test_cli_path_beats_env_var() {
    std::env::set_var(CONFIG_ENV_VAR, "/etc/hypnos/from-env.toml");
    let path = resolve_config_path(Some(PathBuf::from("/tmp/cli.toml")));
    std::env::remove_var(CONFIG_ENV_VAR);
    assert_eq!(path, PathBuf::from("/tmp/cli.toml"));
}

#[test]
#[serial]
fn test_env_var_beats_default() {
    std::env::set_var(CONFIG_ENV_VAR, "/etc/hypnos/from-env.toml");
    let path = resolve_config_path(None);
    std::env::remove_var(CONFIG_ENV_VAR);
    assert_eq!(path, PathBuf::from("/etc/hypnos/from-env.toml"));
}

#[test]
#[serial]
fn test_empty_env_var_ignored() {
    std::env::set_var(CONFIG_ENV_VAR, "");
    let path = resolve_config_path(None);
    std::env::remove_var(CONFIG_ENV_VAR);
    assert!(path.ends_with("hypnos.toml"));
}

#[test]
fn test_partial_file_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hypnos.toml");
    std::fs::write(
        &path,
        r#"
[scheduler]
short_term_interval = 600

[breakers.overrides.llm_service]
failure_threshold = 2
timeout = 30

[processor]
command = "dbt"
args = ["run"]
"#,
    )
    .unwrap();

    let config = HypnosConfig::from_file(&path).unwrap();
    assert_eq!(config.scheduler.short_term_interval, Duration::from_secs(600));
    assert_eq!(config.scheduler.long_term_interval, Duration::from_secs(5400));
    assert_eq!(
        config.breakers.for_dependency(Dependency::LlmService).failure_threshold,
        2
    );
    assert_eq!(
        config.breakers.for_dependency(Dependency::StorageEngine).failure_threshold,
        5
    );
    assert_eq!(config.processor.command, "dbt");
    assert!(config.processor.selectors.contains_key(&RhythmType::ShortTerm));
}
