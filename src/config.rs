//! Runtime settings
//!
//! Read once at startup from `config/antinuke.yaml`. Every field has a default,
//! so the file is optional and may list only the values it overrides.

use crate::Error;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default location of the settings file
pub const SETTINGS_FILE: &str = "config/antinuke.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Length of the counting window
    pub window_secs: u64,
    /// Upper bound for a single moderation or notification call
    pub moderation_timeout_secs: u64,
    /// Upper bound for reading a community's configuration on a cache miss
    pub store_timeout_ms: u64,
    /// Interval between background refreshes of cached configuration
    pub cache_refresh_secs: u64,
    /// Directory holding the persisted configuration
    pub data_dir: PathBuf,
    /// Name used in audit log reasons and notifications
    pub engine_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            moderation_timeout_secs: 10,
            store_timeout_ms: 2000,
            cache_refresh_secs: 300,
            data_dir: PathBuf::from("data"),
            engine_name: "Daemon".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file, falling back to defaults if it is missing
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No settings file found, using defaults");
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let settings: Self = serde_yaml::from_str(&content)?;
        info!(path = %path.display(), "Settings loaded");
        Ok(settings)
    }

    /// Counting window, saturating for values chrono cannot represent
    #[must_use]
    pub fn window(&self) -> TimeDelta {
        i64::try_from(self.window_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    #[must_use]
    pub fn moderation_timeout(&self) -> Duration {
        Duration::from_secs(self.moderation_timeout_secs)
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    #[must_use]
    pub fn cache_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.window(), chrono::Duration::seconds(60));
        assert_eq!(settings.moderation_timeout(), Duration::from_secs(10));
        assert_eq!(settings.store_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_yaml() {
        let settings: Settings =
            serde_yaml::from_str("engine_name: Sentinel\nwindow_secs: 30\n").unwrap();
        assert_eq!(settings.engine_name, "Sentinel");
        assert_eq!(settings.window(), chrono::Duration::seconds(30));
        assert_eq!(settings.cache_refresh_secs, 300);
    }

    #[test]
    fn test_oversized_window_saturates() {
        let settings = Settings {
            window_secs: u64::MAX / 2,
            ..Settings::default()
        };
        assert_eq!(settings.window(), TimeDelta::MAX);
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let settings = Settings::load("does/not/exist.yaml").await.unwrap();
        assert_eq!(settings, Settings::default());
    }
}
