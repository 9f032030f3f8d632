use crate::domain::models::{AuthKey, DeviceAddress};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_true(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Timing knobs of the device session, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_heart_keep_alive_ms")]
    pub heart_keep_alive_period_ms: u64,
    #[serde(default = "default_acceleration_rearm_ms")]
    pub acceleration_rearm_period_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            heart_keep_alive_period_ms: default_heart_keep_alive_ms(),
            acceleration_rearm_period_ms: default_acceleration_rearm_ms(),
        }
    }
}

/// A band that completed pairing at least once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDevice {
    pub address: DeviceAddress,
    pub auth_key: AuthKey,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Session timing
    #[serde(default)]
    pub session: SessionSettings,

    // Pairing
    #[serde(default)]
    pub paired_device: Option<PairedDevice>,
    #[serde(default)]
    pub known_addresses: Vec<DeviceAddress>,
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "fitness_band".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_step_timeout_ms() -> u64 {
    20_000
}
fn default_command_timeout_ms() -> u64 {
    5_000
}
fn default_heart_keep_alive_ms() -> u64 {
    10_000
}
fn default_acceleration_rearm_ms() -> u64 {
    65_000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file; a missing or unreadable file yields defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("FitnessBand");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    /// Record a successful pairing and persist it
    pub fn remember_pairing(
        &mut self,
        address: DeviceAddress,
        auth_key: AuthKey,
    ) -> anyhow::Result<()> {
        if !self.settings.known_addresses.contains(&address) {
            self.settings.known_addresses.push(address.clone());
        }
        self.settings.paired_device = Some(PairedDevice { address, auth_key });
        self.save()
    }

    pub fn forget_pairing(&mut self) -> anyhow::Result<()> {
        self.settings.paired_device = None;
        self.save()
    }
}
