// src/settings.rs
//
// Store configuration, loaded from TOML. Missing keys fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BufferError, Result};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StoreSettings {
    /// SQLite file for buffer data (None = in-memory)
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Rows sampled by CSV preview
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,
    /// Raw-mode force-split length when a framing config leaves it unset
    #[serde(default = "default_raw_max_length")]
    pub raw_max_length: usize,
    /// Minimum frame length when a framing config leaves it unset
    #[serde(default = "default_min_length")]
    pub default_min_length: usize,
    /// Write rejected frames to a secondary buffer
    #[serde(default = "default_keep_filtered")]
    pub keep_filtered: bool,
    /// Filtered position indices kept for timestamp search
    #[serde(default = "default_filter_index_cache_size")]
    pub filter_index_cache_size: usize,
    /// Directory for log files (None = stderr only)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String, // "error" | "warn" | "info" | "debug" | "trace"
}

fn default_preview_rows() -> usize {
    20
}
fn default_raw_max_length() -> usize {
    1024
}
fn default_min_length() -> usize {
    1
}
fn default_keep_filtered() -> bool {
    true
}
fn default_filter_index_cache_size() -> usize {
    8
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            preview_rows: default_preview_rows(),
            raw_max_length: default_raw_max_length(),
            default_min_length: default_min_length(),
            keep_filtered: default_keep_filtered(),
            filter_index_cache_size: default_filter_index_cache_size(),
            log_dir: None,
            log_level: default_log_level(),
        }
    }
}

impl StoreSettings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BufferError::File {
            path: path.display().to_string(),
            message: format!("Failed to read settings: {}", e),
        })?;
        toml::from_str(&content)
            .map_err(|e| BufferError::Settings(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Load settings if the file exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("[settings] {:?} not found, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Write settings as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| BufferError::Settings(format!("Failed to serialize settings: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Per-user data directory for the store (database, logs).
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("wiretap-buffers"))
}

/// Settings file used when none is named explicitly.
pub fn default_settings_path() -> Option<PathBuf> {
    default_data_dir().map(|d| d.join("settings.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_use_defaults() {
        let settings: StoreSettings = toml::from_str("preview_rows = 5\n").unwrap();
        assert_eq!(settings.preview_rows, 5);
        assert_eq!(settings.raw_max_length, 1024);
        assert_eq!(settings.default_min_length, 1);
        assert!(settings.keep_filtered);
        assert_eq!(settings.filter_index_cache_size, 8);
        assert_eq!(settings.log_level, "info");
        assert!(settings.database_path.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.toml");
        let settings = StoreSettings {
            database_path: Some(dir.path().join("buffers.db")),
            keep_filtered: false,
            ..StoreSettings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(StoreSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StoreSettings::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, StoreSettings::default());
    }

    #[test]
    fn test_default_settings_path_in_data_dir() {
        if let Some(path) = default_settings_path() {
            assert!(path.ends_with("wiretap-buffers/settings.toml"));
            assert_eq!(path.parent(), default_data_dir().as_deref());
        }
    }

    #[test]
    fn test_invalid_toml_is_settings_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "preview_rows = \"many\"").unwrap();
        assert!(matches!(StoreSettings::load(&path), Err(BufferError::Settings(_))));
    }
}
