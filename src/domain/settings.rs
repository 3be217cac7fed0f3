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
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Peripheral profile and link tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub write_char_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub notify_char_uuid: String,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_requested_mtu")]
    pub requested_mtu: u16,
    /// Upper bound for an unterminated line. `null` disables the cap.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: Option<usize>,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            service_uuid: default_service_uuid(),
            write_char_uuid: default_write_uuid(),
            notify_char_uuid: default_notify_uuid(),
            scan_timeout_ms: default_scan_timeout_ms(),
            requested_mtu: default_requested_mtu(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseSettings {
    #[serde(default = "default_decision_threshold")]
    pub decision_threshold_deg: f32,
    #[serde(default = "default_significance_threshold")]
    pub significance_threshold_deg: f32,
    #[serde(default = "default_max_angle")]
    pub max_angle_deg: f32,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_phase_duration_ms")]
    pub calibration_phase_ms: u64,
}

impl Default for PoseSettings {
    fn default() -> Self {
        Self {
            decision_threshold_deg: default_decision_threshold(),
            significance_threshold_deg: default_significance_threshold(),
            max_angle_deg: default_max_angle(),
            debounce_ms: default_debounce_ms(),
            calibration_phase_ms: default_phase_duration_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold: u32,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            stability_threshold: default_stability_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub pose: PoseSettings,
    #[serde(default)]
    pub classifier: ClassifierSettings,

    // Peripheral defaults sent on every connect
    #[serde(default = "default_brightness")]
    pub brightness: u8,
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: u16,

    /// Hide delay for the calibration-complete prompt.
    #[serde(default = "default_prompt_hide_ms")]
    pub calibration_prompt_hide_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble: BleSettings::default(),
            pose: PoseSettings::default(),
            classifier: ClassifierSettings::default(),
            brightness: default_brightness(),
            sample_rate_hz: default_sample_rate(),
            calibration_prompt_hide_ms: default_prompt_hide_ms(),
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
    "kinetic_pulse".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_device_name() -> String {
    "ESP32-GYRO-ON".to_string()
}
fn default_service_uuid() -> String {
    "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_write_uuid() -> String {
    "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_notify_uuid() -> String {
    "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_scan_timeout_ms() -> u64 {
    15_000
}
fn default_requested_mtu() -> u16 {
    512
}
fn default_max_line_bytes() -> Option<usize> {
    Some(16 * 1024)
}
fn default_decision_threshold() -> f32 {
    25.0
}
fn default_significance_threshold() -> f32 {
    15.0
}
fn default_max_angle() -> f32 {
    90.0
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_phase_duration_ms() -> u64 {
    1500
}
fn default_confidence_threshold() -> f32 {
    0.2
}
fn default_stability_threshold() -> u32 {
    3
}
fn default_brightness() -> u8 {
    128
}
fn default_sample_rate() -> u16 {
    50
}
fn default_prompt_hide_ms() -> u64 {
    2000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory, falling back to defaults.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load_from(settings_path))
    }

    /// Load from an explicit file. A missing or unreadable file yields defaults
    /// that will be written back to `path` on `save()`.
    pub fn load_from(path: impl Into<PathBuf>) -> Self {
        let settings_path = path.into();
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
        path.push("KineticPulse");
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
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
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

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_fills_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.ble.device_name, "ESP32-GYRO-ON");
        assert_eq!(settings.ble.scan_timeout_ms, 15_000);
        assert_eq!(settings.pose.debounce_ms, 500);
        assert_eq!(settings.classifier.stability_threshold, 3);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"pose": {"debounce_ms": 250}, "ble": {"max_line_bytes": null}}"#)
                .unwrap();
        assert_eq!(settings.pose.debounce_ms, 250);
        assert_eq!(settings.pose.calibration_phase_ms, 1500);
        assert_eq!(settings.ble.max_line_bytes, None);
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!(
            "kinetic_pulse_settings_{}.json",
            std::process::id()
        ));
        let mut service = SettingsService::load_from(&path);
        service.get_mut().brightness = 42;
        service.save().unwrap();

        let reloaded = SettingsService::load_from(&path);
        assert_eq!(reloaded.get().brightness, 42);
        let _ = fs::remove_file(&path);
    }
}
