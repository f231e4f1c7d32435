// src/config.rs

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEV_MODE_ENV: &str = "PRIVACY_ERASER_DEV_MODE";
pub const DATA_DIR_ENV: &str = "PRIVACY_ERASER_DATA_DIR";
pub const RULES_DIR_ENV: &str = "PRIVACY_ERASER_RULES_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    // Mode
    pub dev_mode: bool,                 // Default: false (env PRIVACY_ERASER_DEV_MODE)

    // Locations
    pub data_dir: PathBuf,              // Default: ~/.privacy_eraser
    pub rules_dir: PathBuf,             // Default: ./cleaners
    pub sample_data_dir: PathBuf,       // Default: <data_dir>/test_data

    // Backups
    pub backup_before_clean: bool,      // Default: true
    pub backup_retention_days: i64,     // Default: 7
    pub max_backups: usize,             // Default: 5

    // Execution
    pub scheduler_workers: usize,       // Default: 2
    pub script_timeout_secs: u64,       // Default: 300
    pub skip_running_browsers: bool,    // Default: true
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        AppConfig {
            dev_mode: false,
            sample_data_dir: data_dir.join("test_data"),
            data_dir,
            rules_dir: PathBuf::from("cleaners"),
            backup_before_clean: true,
            backup_retention_days: 7,
            max_backups: 5,
            scheduler_workers: 2,
            script_timeout_secs: 300,
            skip_running_browsers: true,
        }
    }
}

impl AppConfig {
    /// Defaults, then `<data_dir>/config.json` if present, then env overrides.
    pub fn load() -> Self {
        let mut config = AppConfig::default();
        if let Ok(dir) = env::var(DATA_DIR_ENV) {
            config.rebase(PathBuf::from(dir));
        }

        let file = config.data_dir.join("config.json");
        if file.exists() {
            match Self::from_file(&file) {
                Ok(loaded) => config = loaded,
                Err(e) => log::warn!("Ignoring unreadable config {}: {}", file.display(), e),
            }
        }

        config.apply_env();
        config
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Rooted at `data_dir`, used by tests and embedders that sandbox the engine.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = AppConfig::default();
        config.rebase(data_dir.into());
        config
    }

    fn rebase(&mut self, data_dir: PathBuf) {
        self.sample_data_dir = data_dir.join("test_data");
        self.data_dir = data_dir;
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var(DEV_MODE_ENV) {
            self.dev_mode = is_truthy(&value);
        }
        if let Ok(dir) = env::var(DATA_DIR_ENV) {
            self.rebase(PathBuf::from(dir));
        }
        if let Ok(dir) = env::var(RULES_DIR_ENV) {
            self.rules_dir = PathBuf::from(dir);
        }
    }

    pub fn schedules_path(&self) -> PathBuf {
        self.data_dir.join("schedules.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(env::temp_dir)
        .join(".privacy_eraser")
}

fn is_truthy(value: &str) -> bool {
    let lowercase = value.trim().to_ascii_lowercase();
    lowercase == "1" || lowercase == "true" || lowercase == "yes"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_retention_policy() {
        let config = AppConfig::default();
        assert!(!config.dev_mode);
        assert_eq!(config.backup_retention_days, 7);
        assert_eq!(config.max_backups, 5);
        assert_eq!(config.scheduler_workers, 2);
        assert!(config.schedules_path().ends_with("schedules.json"));
    }

    #[test]
    fn with_data_dir_moves_every_location() {
        let temp = TempDir::new().unwrap();
        let config = AppConfig::with_data_dir(temp.path());
        assert_eq!(config.schedules_path(), temp.path().join("schedules.json"));
        assert_eq!(config.backups_dir(), temp.path().join("backups"));
        assert_eq!(config.sample_data_dir, temp.path().join("test_data"));
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, r#"{ "max_backups": 3, "dev_mode": true }"#).unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.max_backups, 3);
        assert!(config.dev_mode);
        assert_eq!(config.backup_retention_days, 7);
    }

    #[test]
    fn truthy_values() {
        assert!(is_truthy("TRUE"));
        assert!(is_truthy(" yes "));
        assert!(is_truthy("1"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy(""));
    }
}
