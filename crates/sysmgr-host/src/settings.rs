// Host settings
// Loaded from ~/.config/sysmgr-host/settings.json unless a path is given.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use sysmgr_bus::BACKUP_SERVICE_NAME;

/// Which categories of data the backup responder offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupFlags {
    pub files: bool,
    pub cookies: bool,
}

impl Default for BackupFlags {
    fn default() -> Self {
        Self {
            files: true,
            cookies: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub bind: String,
    pub port: u16,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 2224,
        }
    }
}

/// Persistent configuration for sysmgr-host. Absent keys take defaults; an
/// empty path disables that entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub service_name: String,
    pub launcher_cards: PathBuf,
    pub first_card_launch: PathBuf,
    pub quicklaunch_user_positions: PathBuf,
    pub dock_mode_user_positions: PathBuf,
    pub launcher_pages_dir: PathBuf,
    pub backup: BackupFlags,
    pub daemon: DaemonSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let prefs = Path::new("/var/luna/preferences");
        Self {
            service_name: BACKUP_SERVICE_NAME.to_string(),
            launcher_cards: prefs.join("launcher-cards.json"),
            first_card_launch: prefs.join("used-first-card"),
            quicklaunch_user_positions: prefs.join("ql-user-positions.json"),
            dock_mode_user_positions: prefs.join("dockmode-user-positions.json"),
            launcher_pages_dir: prefs.join("launcher3").join("pages"),
            backup: BackupFlags::default(),
            daemon: DaemonSettings::default(),
        }
    }
}

impl Settings {
    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => load_settings_from(path),
            None => load_settings_from(&settings_path()?),
        }
    }
}

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("org", "webos", "sysmgr-host")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    let config = dirs.config_dir().to_path_buf();
    std::fs::create_dir_all(&config)?;
    Ok(config)
}

fn settings_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("settings.json"))
}

fn load_settings_from(path: &Path) -> Result<Settings> {
    if path.exists() {
        let data = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&data)
            .map_err(|e| anyhow::anyhow!("invalid settings in {}: {}", path.display(), e))?;
        tracing::info!("Loaded settings from {}", path.display());
        Ok(settings)
    } else {
        tracing::info!("No settings at {}, using defaults", path.display());
        Ok(Settings::default())
    }
}

#[cfg(test)]
fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    let data = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, data)?;
    Ok(())
}
