use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::FixedOffset;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::report::DayAttribution;

const APP_NAME: &str = "timetrack";
const CONFIG_FILE: &str = "config.json";
const DATABASE_FILE: &str = "timetrack.db";

/// Environment variable that overrides the database location.
pub const DATABASE_ENV: &str = "TIMETRACK_DB";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Where the SQLite store lives. Defaults to the platform data directory.
    pub database_path: Option<PathBuf>,
    /// Project used when a timer is started without naming a task.
    pub default_project: String,
    /// Task used when a timer is started without naming a task.
    pub default_task: String,
    /// Offset used to find local calendar days in reports. Falls back to the
    /// system's current offset.
    pub utc_offset_minutes: Option<i32>,
    pub day_attribution: DayAttribution,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            default_project: "General".to_string(),
            default_task: "Daily task".to_string(),
            utc_offset_minutes: None,
            day_attribution: DayAttribution::default(),
        }
    }
}

impl TrackerConfig {
    /// Load configuration from the user's config directory.
    /// Returns default config if file doesn't exist or fails to parse.
    pub fn load() -> Self {
        match get_config_path().and_then(|path| Self::load_from(&path)) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config, using defaults: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config = serde_json::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save the current configuration to the user's config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Resolve the store location: `TIMETRACK_DB`, then the config file, then
    /// the platform data directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = std::env::var_os(DATABASE_ENV) {
            return Ok(PathBuf::from(path));
        }
        if let Some(path) = &self.database_path {
            return Ok(path.clone());
        }
        Ok(project_dirs()?.data_dir().join(DATABASE_FILE))
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset_minutes
            .and_then(|minutes| FixedOffset::east_opt(minutes.saturating_mul(60)))
            .unwrap_or_else(|| *chrono::Local::now().offset())
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrackerConfig::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, TrackerConfig::default());
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = TrackerConfig {
            default_task: "Admin".to_string(),
            utc_offset_minutes: Some(120),
            day_attribution: DayAttribution::StartDay,
            ..TrackerConfig::default()
        };

        config.save_to(&path).unwrap();
        let loaded = TrackerConfig::load_from(&path).unwrap();

        assert_eq!(loaded, config);
        assert_eq!(loaded.utc_offset(), FixedOffset::east_opt(7200).unwrap());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "default_project": "Clients" }"#).unwrap();

        let config = TrackerConfig::load_from(&path).unwrap();

        assert_eq!(config.default_project, "Clients");
        assert_eq!(config.default_task, "Daily task");
        assert_eq!(config.day_attribution, DayAttribution::Proportional);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(TrackerConfig::load_from(&path).is_err());
    }
}
