//! # lamina-config
//!
//! Configuration management for Lamina.
//!
//! Loads configuration from:
//! 1. `~/.lamina/config.toml` (global)
//! 2. `.lamina/config.toml` (project-local, overrides global)
//! 3. `LAMINA_*` environment variables (highest priority)

pub mod logging;
pub mod testing;

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|e| {
        eprintln!("[lamina-config] WARNING: failed to load config: {e}. Using defaults.");
        Config::default()
    }))
});

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub map: MapConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load config from standard locations (CWD-relative project config)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_for_project(Path::new("."))
    }

    /// Load config for a specific project root directory.
    /// Resolution order: global → project → env vars.
    pub fn load_for_project(project_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        let project_config_path = project_root.join(".lamina/config.toml");
        if project_config_path.exists() {
            debug!("loading project config from {:?}", project_config_path);
            let contents = std::fs::read_to_string(&project_config_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Global config path: ~/.lamina/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".lamina/config.toml"))
    }

    /// Merge another config (project overrides global).
    /// Non-default values from `other` replace values in `self`.
    fn merge(&mut self, other: Config) {
        let default_map = MapConfig::default();
        if other.map.file != default_map.file {
            self.map.file = other.map.file;
        }
        if other.map.case_insensitive != default_map.case_insensitive {
            self.map.case_insensitive = other.map.case_insensitive;
        }
        if other.map.sync_writes != default_map.sync_writes {
            self.map.sync_writes = other.map.sync_writes;
        }

        let default_log = LogConfig::default();
        if other.log.level != default_log.level {
            self.log.level = other.log.level;
        }
    }

    /// Apply environment variable overrides (highest priority)
    fn apply_env_overrides(&mut self) {
        if let Ok(file) = std::env::var("LAMINA_MAP_FILE") {
            self.map.file = file;
        }
        if let Ok(v) = std::env::var("LAMINA_CASE_INSENSITIVE") {
            self.map.case_insensitive = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("LAMINA_SYNC_WRITES") {
            self.map.sync_writes = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(level) = std::env::var("LAMINA_LOG_LEVEL") {
            self.log.level = level;
        }
    }
}

/// Path map configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MapConfig {
    /// Path map file name inside the writable layer
    pub file: String,
    /// Fold path case before hashing. Must never change for an existing
    /// map file; the format does not record which mode produced it.
    pub case_insensitive: bool,
    /// Fsync after every write transaction
    pub sync_writes: bool,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            file: ".lamina.map".to_string(),
            case_insensitive: false,
            sync_writes: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Default level filter: error, warn, info, debug or trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Lock for tests that modify environment variables to prevent race
    // conditions when tests run in parallel
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.map.file, ".lamina.map");
        assert!(!config.map.case_insensitive);
        assert!(config.map.sync_writes);
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn test_toml_roundtrip_preserves_values() {
        let mut original = Config::default();
        original.map.file = "custom.map".to_string();
        original.map.case_insensitive = true;

        let toml_str = toml::to_string(&original).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(original.map, parsed.map);
        assert_eq!(original.log, parsed.log);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let partial_toml = r#"
[map]
case_insensitive = true
"#;
        let config: Config = toml::from_str(partial_toml).unwrap();

        assert!(config.map.case_insensitive);
        assert_eq!(config.map.file, ".lamina.map");
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn test_empty_config_uses_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.map.file, MapConfig::default().file);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let result: Result<Config, _> = toml::from_str("invalid { toml }");
        assert!(result.is_err());
    }

    #[test]
    fn test_merge_replaces_non_default_values() {
        let mut base = Config::default();
        let mut overlay = Config::default();
        overlay.map.file = "other.map".to_string();
        overlay.log.level = "debug".to_string();

        base.merge(overlay);
        assert_eq!(base.map.file, "other.map");
        assert_eq!(base.log.level, "debug");
        assert!(base.map.sync_writes);
    }

    #[test]
    fn test_env_override_map_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut config = Config::default();

        std::env::set_var("LAMINA_MAP_FILE", "/env/override.map");
        config.apply_env_overrides();
        std::env::remove_var("LAMINA_MAP_FILE");

        assert_eq!(config.map.file, "/env/override.map");
    }

    #[test]
    fn test_env_override_case_insensitive() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut config = Config::default();

        std::env::set_var("LAMINA_CASE_INSENSITIVE", "true");
        config.apply_env_overrides();
        std::env::remove_var("LAMINA_CASE_INSENSITIVE");

        assert!(config.map.case_insensitive);
    }

    #[test]
    fn test_load_from_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_dir = temp_dir.path().join(".lamina");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            "[map]\nfile = \"project.map\"\n",
        )
        .unwrap();

        let _guard = ENV_LOCK.lock().unwrap();
        let config = Config::load_for_project(temp_dir.path()).unwrap();
        assert_eq!(config.map.file, "project.map");
    }

    #[test]
    fn test_global_config_path() {
        let path = Config::global_config_path().unwrap();
        assert!(path.ends_with(".lamina/config.toml"));
    }
}
