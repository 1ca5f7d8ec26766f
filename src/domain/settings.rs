use crate::domain::night_window::{NightWindow, MINUTES_PER_DAY};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the settings file location
pub const SETTINGS_PATH_ENV: &str = "DOCK_SYNC_SETTINGS";

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
    "dock_sync".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Daily window in which a detection cycle may start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NightWindowSettings {
    pub start_hour: u32,
    pub start_minute: u32,
    pub end_hour: u32,
    pub end_minute: u32,
    /// When set, the end is derived from the start and this length
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

impl Default for NightWindowSettings {
    fn default() -> Self {
        Self {
            start_hour: 22,
            start_minute: 0,
            end_hour: 6,
            end_minute: 0,
            duration_minutes: None,
        }
    }
}

impl NightWindowSettings {
    pub fn window(&self) -> NightWindow {
        match self.duration_minutes {
            Some(minutes) => NightWindow::from_duration(self.start_hour, self.start_minute, minutes),
            None => NightWindow::new(
                self.start_hour,
                self.start_minute,
                self.end_hour,
                self.end_minute,
            ),
        }
    }
}

/// Detection cycle timing, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_scan_duration_ms")]
    pub scan_duration_ms: u64,
    #[serde(default = "default_scan_period_ms")]
    pub scan_period_ms: u64,
    #[serde(default = "default_monitoring_phase_duration_ms")]
    pub monitoring_phase_duration_ms: u64,
    #[serde(default = "default_undocked_timeout_ms")]
    pub undocked_timeout_ms: u64,
    #[serde(default = "default_silent_state_duration_ms")]
    pub silent_state_duration_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            scan_duration_ms: default_scan_duration_ms(),
            scan_period_ms: default_scan_period_ms(),
            monitoring_phase_duration_ms: default_monitoring_phase_duration_ms(),
            undocked_timeout_ms: default_undocked_timeout_ms(),
            silent_state_duration_ms: default_silent_state_duration_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl TimingSettings {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }
    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_ms)
    }
    pub fn monitoring_phase_duration(&self) -> Duration {
        Duration::from_millis(self.monitoring_phase_duration_ms)
    }
    pub fn undocked_timeout(&self) -> Duration {
        Duration::from_millis(self.undocked_timeout_ms)
    }
    pub fn silent_state_duration(&self) -> Duration {
        Duration::from_millis(self.silent_state_duration_ms)
    }
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn default_scan_duration_ms() -> u64 {
    12_000
}
fn default_scan_period_ms() -> u64 {
    60_000
}
fn default_monitoring_phase_duration_ms() -> u64 {
    10 * 60_000
}
fn default_undocked_timeout_ms() -> u64 {
    3 * 60_000
}
fn default_silent_state_duration_ms() -> u64 {
    30 * 60_000
}
fn default_read_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Fragment of the sensor's advertised name, matched case-insensitively
    #[serde(default = "default_device_name_fragment")]
    pub device_name_fragment: String,

    #[serde(default)]
    pub night_window: NightWindowSettings,

    #[serde(default)]
    pub timing: TimingSettings,

    // Bluetooth Settings
    #[serde(default = "default_rfcomm_channel")]
    pub rfcomm_channel: u8,
    #[serde(default = "default_false")]
    pub disable_radio_during_backoff: bool,

    /// Keep cycling after the window closes instead of returning to idle
    #[serde(default = "default_false")]
    pub continue_past_window: bool,

    /// How often the idle loop re-checks the night window
    #[serde(default = "default_idle_poll_secs")]
    pub idle_poll_secs: u64,

    #[serde(default = "default_capture_dir")]
    pub capture_dir: String,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_name_fragment: default_device_name_fragment(),
            night_window: NightWindowSettings::default(),
            timing: TimingSettings::default(),
            rfcomm_channel: default_rfcomm_channel(),
            disable_radio_during_backoff: false,
            continue_past_window: false,
            idle_poll_secs: default_idle_poll_secs(),
            capture_dir: default_capture_dir(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_device_name_fragment() -> String {
    "sensor".to_string()
}
fn default_rfcomm_channel() -> u8 {
    1
}
fn default_idle_poll_secs() -> u64 {
    60
}
fn default_capture_dir() -> String {
    dirs::data_dir()
        .map(|dir| dir.join("DockSync").join("captures"))
        .unwrap_or_else(|| PathBuf::from("captures"))
        .to_string_lossy()
        .into_owned()
}

impl Settings {
    /// Reject settings the state machine cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        let window = &self.night_window;
        if window.start_hour > 23 || window.end_hour > 23 {
            anyhow::bail!("night window hours must be in 0..=23");
        }
        if window.start_minute > 59 || window.end_minute > 59 {
            anyhow::bail!("night window minutes must be in 0..=59");
        }
        if let Some(minutes) = window.duration_minutes {
            if minutes == 0 || minutes > MINUTES_PER_DAY {
                anyhow::bail!("night window duration_minutes must be in 1..={}", MINUTES_PER_DAY);
            }
        }
        if self.device_name_fragment.trim().is_empty() {
            anyhow::bail!("device_name_fragment must not be empty");
        }

        let t = &self.timing;
        for (name, value) in [
            ("scan_duration_ms", t.scan_duration_ms),
            ("scan_period_ms", t.scan_period_ms),
            ("monitoring_phase_duration_ms", t.monitoring_phase_duration_ms),
            ("undocked_timeout_ms", t.undocked_timeout_ms),
            ("silent_state_duration_ms", t.silent_state_duration_ms),
            ("read_timeout_ms", t.read_timeout_ms),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be > 0", name);
            }
        }
        if t.scan_duration_ms > t.scan_period_ms {
            anyhow::bail!("scan_duration_ms must not exceed scan_period_ms");
        }
        Ok(())
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
    load_error: Option<String>,
}

impl SettingsService {
    /// Load from the default location or `DOCK_SYNC_SETTINGS`
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Self::from_path(settings_path)
    }

    /// Load settings from `path`, writing defaults there when the file is missing
    pub fn from_path(settings_path: PathBuf) -> anyhow::Result<Self> {
        let mut load_error = None;
        let settings = if settings_path.exists() {
            match Self::load_from_file(&settings_path) {
                Ok(settings) => settings,
                Err(e) => {
                    load_error = Some(e.to_string());
                    Settings::default()
                }
            }
        } else {
            Settings::default()
        };

        let service = Self {
            settings,
            settings_path,
            load_error,
        };
        if !service.settings_path.exists() {
            service.save()?;
        }
        Ok(service)
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        if let Ok(path) = std::env::var(SETTINGS_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("DockSync");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    /// Write the settings as pretty JSON, creating parent directories
    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    #[cfg(test)]
    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    /// Why an existing file was replaced by defaults, reported once logging is up
    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }
}
