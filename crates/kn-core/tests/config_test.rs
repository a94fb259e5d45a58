use kn_core::config::{Config, ConfigError};

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("[executor]"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.executor.command, cfg.executor.command);
    assert_eq!(parsed.workspace.excluded_dirs, cfg.workspace.excluded_dirs);
    assert_eq!(parsed.hardware.flash_timeout_secs, 60);
    parsed.validate().expect("config validates");
}

#[test]
fn load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[general]
log_level = "debug"

[workspace]
root = "/tmp/kiln-work"
manifest_max_entries = 50
"#,
    )
    .unwrap();

    let cfg = Config::load_from(&path).expect("load");
    assert_eq!(cfg.general.log_level, "debug");
    assert_eq!(cfg.workspace.manifest_max_entries, 50);
    assert_eq!(cfg.workspace.root_dir(), std::path::PathBuf::from("/tmp/kiln-work"));
    // untouched sections keep defaults
    assert_eq!(cfg.context.summary_max_words, 500);
}

#[test]
fn load_from_rejects_invalid_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[context]\nsummary_max_words = 0\n").unwrap();

    let err = Config::load_from(&path).expect_err("validation should fail");
    assert!(matches!(err, ConfigError::Validation(_)));
    assert!(err.to_string().contains("summary_max_words"));
}

#[test]
fn load_from_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load_from(dir.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn malformed_toml_is_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[executor\ncommand = ").unwrap();
    assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
}
