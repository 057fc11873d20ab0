use bench_core::{AppConfig, ConfigError, Settings, atomic};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_config_builder() {
    let config = AppConfig::builder()
        .plugin_dir("/srv/bench/plugins")
        .settings_path("/srv/bench/settings.toml")
        .start_timeout_ms(1500u64)
        .allow_exec(true)
        .build()
        .unwrap();

    assert_eq!(config.plugin_dir, PathBuf::from("/srv/bench/plugins"));
    assert_eq!(config.start_timeout_ms, 1500);
    assert_eq!(config.max_memory_mb, 64);
    assert!(config.allow_exec);
    assert!(!config.allow_fs_read);

    // Test validation
    assert!(AppConfig::builder().start_timeout_ms(0u64).build().is_err());
    assert!(AppConfig::builder().plugin_dir("").build().is_err());
}

#[test]
fn test_config_file_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bench.toml");
    fs::write(
        &path,
        r#"
plugin_dir = "/tmp/bench-plugins"
start_timeout_ms = 250
allow_fs_read = true

[extension_aliases]
plugin = "lua"
script = "rhai"
"#,
    )
    .unwrap();

    let config = AppConfig::load(&path).unwrap();
    assert_eq!(config.plugin_dir, PathBuf::from("/tmp/bench-plugins"));
    assert_eq!(config.start_timeout_ms, 250);
    assert!(config.allow_fs_read);
    assert_eq!(config.extension_aliases.len(), 2);
    assert_eq!(config.extension_aliases["script"], "rhai");
    assert_eq!(config.max_memory_mb, AppConfig::default().max_memory_mb);
}

#[test]
fn test_config_rejects_unknown_keys_and_bad_values() {
    let dir = TempDir::new().unwrap();

    let path = dir.path().join("typo.toml");
    fs::write(&path, "plugin_dri = \"/x\"\n").unwrap();
    assert!(matches!(
        AppConfig::load(&path),
        Err(ConfigError::Parse { .. })
    ));

    let path = dir.path().join("zero.toml");
    fs::write(&path, "start_timeout_ms = 0\n").unwrap();
    assert!(matches!(
        AppConfig::load(&path),
        Err(ConfigError::Invalid { .. })
    ));
}

#[test]
fn test_settings_survive_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("settings.toml");

    let mut settings = Settings::load(&path).unwrap();
    settings.set_bool("plugin.weather.plugin", false).unwrap();
    settings.set("ui.theme", "dark").unwrap();
    drop(settings);

    let settings = Settings::load(&path).unwrap();
    assert!(!settings.get_bool("plugin.weather.plugin", true));
    assert_eq!(settings.get("ui.theme"), Some("dark"));
    assert!(settings.get_bool("plugin.unknown.lua", true));

    let plugin_keys: Vec<&str> = settings.keys_with_prefix("plugin.").collect();
    assert_eq!(plugin_keys, vec!["weather.plugin"]);
}

#[test]
fn test_settings_writes_leave_no_temp_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.toml");

    let mut settings = Settings::load(&path).unwrap();
    for i in 0..10 {
        settings.set_bool(format!("plugin.p{i}.lua"), i % 2 == 0).unwrap();
    }

    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["settings.toml".to_string()]);
    assert!(names.iter().all(|n| !atomic::is_temp_name(n)));
}

#[test]
fn test_atomic_copy_replaces_destination() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.lua");
    let dest = dir.path().join("store").join("dest.lua");

    fs::write(&src, "return 1").unwrap();
    atomic::copy_atomic(&src, &dest).unwrap();
    fs::write(&src, "return 2").unwrap();
    let copied = atomic::copy_atomic(&src, &dest).unwrap();

    assert_eq!(copied, 8);
    assert_eq!(fs::read_to_string(&dest).unwrap(), "return 2");
}
