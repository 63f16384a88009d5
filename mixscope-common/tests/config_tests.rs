//! Integration tests for configuration loading and graceful degradation
//!
//! A missing or malformed TOML file must never stop startup; the service falls back to
//! compiled defaults.
//!
//! Tests that touch MIXSCOPE_* variables are marked #[serial].

use mixscope_common::config::{
    load_toml_config, write_toml_config, RootFolderInitializer, RootFolderResolver, TomlConfig,
    ROOT_FOLDER_ENV,
};
use serial_test::serial;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
#[serial]
fn tc_config_001_full_startup_resolution() {
    // Given: a TOML file that names a root folder inside a temp dir
    let temp_dir = TempDir::new().unwrap();
    let toml_path = temp_dir.path().join("config.toml");
    let root = temp_dir.path().join("data");

    let mut config = TomlConfig::default();
    config.root_folder = Some(root.clone());
    config.worker.concurrency = 2;
    write_toml_config(&config, &toml_path).unwrap();

    // When: it is loaded and resolved without CLI or environment overrides
    std::env::remove_var(ROOT_FOLDER_ENV);
    let mut loaded = load_toml_config(&toml_path).unwrap();
    loaded.apply_env_overrides();
    let resolved = RootFolderResolver::new(None, &loaded).resolve();

    // Then: the TOML root folder is used and the database lands inside it
    assert_eq!(resolved, root);
    let initializer = RootFolderInitializer::new(resolved);
    initializer.ensure_directory_exists().unwrap();
    assert!(root.is_dir());
    assert!(initializer.database_path().starts_with(&root));
    assert_eq!(loaded.worker.concurrency, 2);
}

#[test]
fn tc_config_002_missing_file_is_error_not_panic() {
    let result = load_toml_config(&PathBuf::from("/nonexistent/mixscope/config.toml"));
    assert!(result.is_err());
}

#[test]
fn tc_config_003_unknown_keys_are_tolerated() {
    // Forward compatibility: keys from newer releases are ignored
    let config: TomlConfig = toml::from_str(
        r#"
        future_option = true

        [server]
        port = 9000
        "#,
    )
    .unwrap();
    assert_eq!(config.server.port, 9000);
}
