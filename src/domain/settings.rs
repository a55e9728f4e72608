use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

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
    "astro_client".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub known_bluetooth_addresses: Vec<u64>,
    #[serde(default)]
    pub last_connected_address: Option<u64>,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // GATT identifiers
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_config_read_uuid")]
    pub ble_config_read_uuid: String,
    #[serde(default = "default_config_write_uuid")]
    pub ble_config_write_uuid: String,
    #[serde(default = "default_capture_image_uuid")]
    pub ble_capture_image_uuid: String,

    // Scanning
    #[serde(default = "default_true")]
    pub scan_show_all_devices: bool,

    // Ask for the well-known config items right after connecting
    #[serde(default = "default_true")]
    pub refresh_on_connect: bool,

    // Capture sequence defaults
    #[serde(default = "default_capture_takes")]
    pub capture_takes: u32,
    #[serde(default = "default_capture_interval_secs")]
    pub capture_interval_secs: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            known_bluetooth_addresses: Vec::new(),
            last_connected_address: None,
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_config_read_uuid: default_config_read_uuid(),
            ble_config_write_uuid: default_config_write_uuid(),
            ble_capture_image_uuid: default_capture_image_uuid(),
            scan_show_all_devices: default_true(),
            refresh_on_connect: default_true(),
            capture_takes: default_capture_takes(),
            capture_interval_secs: default_capture_interval_secs(),
        }
    }
}

fn default_service_uuid() -> String {
    "6c7028e2-dc4a-11ef-9134-75e88a34574d".to_string()
}
fn default_config_read_uuid() -> String {
    "87bdecc4-dc4a-11ef-ab7f-b7e88a34574d".to_string()
}
fn default_config_write_uuid() -> String {
    "994e9452-dc4a-11ef-b90e-f0e88a34574d".to_string()
}
fn default_capture_image_uuid() -> String {
    "114fc821-6a6e-4e81-bd05-1dd5ab7a679b".to_string()
}
fn default_capture_takes() -> u32 {
    10
}
fn default_capture_interval_secs() -> f64 {
    5.0
}

pub struct SettingsService {
    settings: Settings,
    /// `None` keeps the settings in memory only.
    settings_path: Option<PathBuf>,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path: Some(settings_path),
        })
    }

    pub fn in_memory(settings: Settings) -> Self {
        Self {
            settings,
            settings_path: None,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("AstroClient");
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
        let Some(path) = &self.settings_path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Remember a device that completed the handshake.
    pub fn remember_connected(&mut self, address: u64) -> anyhow::Result<()> {
        if !self.settings.known_bluetooth_addresses.contains(&address) {
            self.settings.known_bluetooth_addresses.push(address);
        }
        self.settings.last_connected_address = Some(address);
        self.save()
    }
}
