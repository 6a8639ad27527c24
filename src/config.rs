use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdbSettings {
    /// Explicit adb binary path; empty means auto-resolve.
    pub command_path: String,
    /// Remote ADB server host; empty means local server.
    pub remote_host: String,
    pub remote_port: u16,
    pub command_timeout_secs: u64,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            remote_host: String::new(),
            remote_port: 5037,
            command_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrcpySettings {
    /// Explicit scrcpy binary path; empty means auto-resolve.
    pub command_path: String,
    /// 0 keeps the device resolution.
    pub max_size: i32,
    pub bit_rate_mbps: u32,
    pub extra_args: String,
}

impl Default for ScrcpySettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            max_size: 0,
            bit_rate_mbps: 8,
            extra_args: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MirrorSettings {
    pub max_fps: u32,
    pub hierarchy_interval_ms: u64,
    pub focus_interval_ms: u64,
    /// Cadence of the screenshot-polling video fallback.
    pub poll_interval_ms: u64,
    /// How long a higher video stage may stay silent before the session
    /// downgrades past it.
    pub video_grace_ms: u64,
    pub clear_log_on_start: bool,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            max_fps: 30,
            hierarchy_interval_ms: 1500,
            focus_interval_ms: 1000,
            poll_interval_ms: 500,
            video_grace_ms: 3000,
            clear_log_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UixSettings {
    pub dump_timeout_secs: u64,
    /// Pause between issuing a file dump and reading it back.
    pub file_settle_ms: u64,
    /// Extra attempts when the device kills the dump process.
    pub killed_retries: u32,
}

impl Default for UixSettings {
    fn default() -> Self {
        Self {
            dump_timeout_secs: 15,
            file_settle_ms: 300,
            killed_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenshotSettings {
    /// Preferred display id; -1 lets best-display probing decide.
    pub display_id: i32,
}

impl Default for ScreenshotSettings {
    fn default() -> Self {
        Self { display_id: -1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistorySettings {
    pub max_entries: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self { max_entries: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub scrcpy: ScrcpySettings,
    #[serde(default)]
    pub mirror: MirrorSettings,
    #[serde(default)]
    pub uix: UixSettings,
    #[serde(default)]
    pub screenshot: ScreenshotSettings,
    #[serde(default)]
    pub history: HistorySettings,
    #[serde(default)]
    pub version: String,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DROIDGLASS_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".droidglass_config.json")
}

pub fn backup_config_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".droidglass_config.backup.json")
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    save_config_to_path(config, &config_path(), &backup_config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(validate_config(AppConfig::default()));
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    let mut config: AppConfig = serde_json::from_value(value.clone()).unwrap_or_default();
    config = apply_legacy_overrides(config, &value);
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

/// Older releases wrote a flat settings file; pick up the keys people
/// actually set so an upgrade does not silently reset them.
fn apply_legacy_overrides(mut config: AppConfig, value: &serde_json::Value) -> AppConfig {
    if let Some(adb_path) = value.get("adb_path").and_then(|v| v.as_str()) {
        if !adb_path.is_empty() {
            config.adb.command_path = adb_path.to_string();
        }
    }
    if let Some(scrcpy_path) = value.get("scrcpy_path").and_then(|v| v.as_str()) {
        if !scrcpy_path.is_empty() {
            config.scrcpy.command_path = scrcpy_path.to_string();
        }
    }
    if let Some(interval) = value.get("hierarchy_interval_ms").and_then(|v| v.as_u64()) {
        config.mirror.hierarchy_interval_ms = interval;
    }
    if let Some(fps) = value.get("max_fps").and_then(|v| v.as_u64()) {
        config.mirror.max_fps = fps as u32;
    }
    if let Some(display_id) = value.get("screenshot_display_id").and_then(|v| v.as_i64()) {
        config.screenshot.display_id = display_id as i32;
    }
    config
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    if config.adb.command_timeout_secs == 0 {
        config.adb.command_timeout_secs = 30;
    }
    if config.scrcpy.max_size < 0 {
        config.scrcpy.max_size = 0;
    }
    if config.scrcpy.bit_rate_mbps == 0 {
        config.scrcpy.bit_rate_mbps = 8;
    }
    if !(1..=60).contains(&config.mirror.max_fps) {
        config.mirror.max_fps = 30;
    }
    if config.mirror.hierarchy_interval_ms < 300 {
        config.mirror.hierarchy_interval_ms = 1500;
    }
    if config.mirror.focus_interval_ms < 250 {
        config.mirror.focus_interval_ms = 1000;
    }
    if config.mirror.poll_interval_ms < 200 {
        config.mirror.poll_interval_ms = 500;
    }
    if config.mirror.video_grace_ms < 500 {
        config.mirror.video_grace_ms = 3000;
    }
    if !(1..=120).contains(&config.uix.dump_timeout_secs) {
        config.uix.dump_timeout_secs = 15;
    }
    if config.uix.file_settle_ms > 5000 {
        config.uix.file_settle_ms = 300;
    }
    if config.screenshot.display_id < -1 {
        config.screenshot.display_id = -1;
    }
    if config.history.max_entries == 0 {
        config.history.max_entries = 10;
    }
    config
}
