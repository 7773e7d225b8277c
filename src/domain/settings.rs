use crate::infrastructure::bluetooth::protocol;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
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
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
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
    "stroke_engine_client".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Timing and GATT layout used by the device client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_command_uuid")]
    pub command_char_uuid: String,
    #[serde(default = "default_speed_knob_uuid")]
    pub speed_knob_char_uuid: String,
    #[serde(default = "default_status_uuid")]
    pub status_char_uuid: String,
    #[serde(default = "default_pattern_list_uuid")]
    pub pattern_list_char_uuid: String,
    #[serde(default = "default_pattern_description_uuid")]
    pub pattern_description_char_uuid: String,

    /// Pause between a command write and its read-back
    #[serde(default = "default_command_settle_ms")]
    pub command_settle_ms: u64,
    /// Pause after opening the link, before service discovery
    #[serde(default = "default_connect_settle_ms")]
    pub connect_settle_ms: u64,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    /// Outage after which a reconnect is followed by an emergency stop
    #[serde(default = "default_safety_stop_after_ms")]
    pub safety_stop_after_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Bound on one connect attempt, link-up through subscription
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on waiting for the device to report each navigation hop
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
    /// Pattern index used by the absolute position controller
    #[serde(default)]
    pub hold_pattern: u32,
}

impl ClientSettings {
    pub fn command_settle(&self) -> Duration {
        Duration::from_millis(self.command_settle_ms)
    }

    pub fn connect_settle(&self) -> Duration {
        Duration::from_millis(self.connect_settle_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn safety_stop_after(&self) -> Duration {
        Duration::from_millis(self.safety_stop_after_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            command_char_uuid: default_command_uuid(),
            speed_knob_char_uuid: default_speed_knob_uuid(),
            status_char_uuid: default_status_uuid(),
            pattern_list_char_uuid: default_pattern_list_uuid(),
            pattern_description_char_uuid: default_pattern_description_uuid(),
            command_settle_ms: default_command_settle_ms(),
            connect_settle_ms: default_connect_settle_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            safety_stop_after_ms: default_safety_stop_after_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            hold_pattern: 0,
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_command_uuid() -> String {
    protocol::COMMAND_CHAR_UUID.to_string()
}
fn default_speed_knob_uuid() -> String {
    protocol::SPEED_KNOB_CHAR_UUID.to_string()
}
fn default_status_uuid() -> String {
    protocol::STATUS_CHAR_UUID.to_string()
}
fn default_pattern_list_uuid() -> String {
    protocol::PATTERN_LIST_CHAR_UUID.to_string()
}
fn default_pattern_description_uuid() -> String {
    protocol::PATTERN_DESCRIPTION_CHAR_UUID.to_string()
}
fn default_command_settle_ms() -> u64 {
    50
}
fn default_connect_settle_ms() -> u64 {
    300
}
fn default_reconnect_backoff_ms() -> u64 {
    250
}
fn default_safety_stop_after_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_command_timeout_ms() -> u64 {
    3000
}
fn default_connect_timeout_ms() -> u64 {
    10000
}
fn default_navigation_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub client: ClientSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, using defaults if it is missing or unreadable
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("StrokeEngineClient");
        fs::create_dir_all(&path)
            .with_context(|| format!("Could not create {}", path.display()))?;
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
        fs::write(&self.settings_path, json)
            .with_context(|| format!("Could not write {}", self.settings_path.display()))?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}
