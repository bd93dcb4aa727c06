use serde::{Deserialize, Serialize};

use crate::{error::SettingsError, types::ThermostatMode};

pub const ABSOLUTE_MIN_TEMP: f32 = 0.0;
pub const ABSOLUTE_MAX_TEMP: f32 = 50.0;
/// Smallest admissible gap between `min_temp` and `max_temp`.
pub const MIN_TEMP_SPAN: f32 = 0.5;
/// Slack on the span check for `min + MIN_TEMP_SPAN` rounding in f32.
pub const SPAN_TOLERANCE: f32 = 1e-3;
pub const MIN_HYSTERESIS: f32 = 0.1;
pub const MAX_HYSTERESIS: f32 = 5.0;
pub const LANGUAGE_CODE_LEN: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermostatConfig {
    pub control_interval_ms: u64,
    pub sensor_interval_ms: u64,
    pub sensor_stale_timeout_ms: u64,
    /// Overshoot above target before the reported heating flag clears.
    pub active_release_band: f32,
    pub min_valid_temp_c: f32,
    pub max_valid_temp_c: f32,
    pub mqtt_poll_interval_ms: u64,
}

impl Default for ThermostatConfig {
    fn default() -> Self {
        Self {
            control_interval_ms: 500,
            sensor_interval_ms: 5_000,
            sensor_stale_timeout_ms: 30_000,
            active_release_band: 1.0,
            min_valid_temp_c: -40.0,
            max_valid_temp_c: 85.0,
            mqtt_poll_interval_ms: 2_000,
        }
    }
}

/// The persisted thermostat record. Field names on the wire match the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub target_temp: f32,
    pub eco_temp: f32,
    pub mode: ThermostatMode,
    pub temp_offset: f32,
    pub hysteresis: f32,
    pub min_temp: f32,
    pub max_temp: f32,
    /// Minimum seconds between threshold-driven display refreshes.
    pub epd_refresh_rate: u32,
    pub temp_change_threshold: f32,
    pub humidity_change_threshold: f32,
    pub timezone: String,
    pub language_code: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_temp: 20.5,
            eco_temp: 16.0,
            mode: ThermostatMode::Off,
            temp_offset: 0.0,
            hysteresis: 0.5,
            min_temp: 10.0,
            max_temp: 35.0,
            epd_refresh_rate: 60,
            temp_change_threshold: 0.5,
            humidity_change_threshold: 2.0,
            timezone: "Europe/Amsterdam".to_string(),
            language_code: "nl".to_string(),
        }
    }
}

impl Settings {
    /// Setpoint the control loop regulates to in the current mode.
    pub fn active_target_temp(&self) -> f32 {
        match self.mode {
            ThermostatMode::Eco => self.eco_temp,
            ThermostatMode::Off | ThermostatMode::On => self.target_temp,
        }
    }

    /// Checks every cross-field invariant without touching anything.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let floats = [
            self.target_temp,
            self.eco_temp,
            self.temp_offset,
            self.hysteresis,
            self.min_temp,
            self.max_temp,
            self.temp_change_threshold,
            self.humidity_change_threshold,
        ];
        if floats.iter().any(|value| !value.is_finite()) {
            return Err(SettingsError::Validation("temperatures must be finite"));
        }
        if self.min_temp < ABSOLUTE_MIN_TEMP || self.max_temp > ABSOLUTE_MAX_TEMP {
            return Err(SettingsError::Validation(
                "minTemp/maxTemp must lie within 0-50",
            ));
        }
        if self.max_temp - self.min_temp < MIN_TEMP_SPAN - SPAN_TOLERANCE {
            return Err(SettingsError::Validation("minTemp must be below maxTemp"));
        }
        if !(self.min_temp..=self.max_temp).contains(&self.target_temp) {
            return Err(SettingsError::Validation(
                "targetTemp must lie between minTemp and maxTemp",
            ));
        }
        if !(self.min_temp..=self.max_temp).contains(&self.eco_temp) {
            return Err(SettingsError::Validation(
                "ecoTemp must lie between minTemp and maxTemp",
            ));
        }
        if !(MIN_HYSTERESIS..=MAX_HYSTERESIS).contains(&self.hysteresis) {
            return Err(SettingsError::Validation("hysteresis must lie within 0.1-5.0"));
        }
        if self.temp_change_threshold < 0.0 || self.humidity_change_threshold < 0.0 {
            return Err(SettingsError::Validation(
                "change thresholds must not be negative",
            ));
        }
        validate_timezone(&self.timezone)?;
        validate_language_code(&self.language_code)?;
        Ok(())
    }

    /// Trimmed timezone, lowercase language code.
    pub(crate) fn normalize_locale(&mut self) {
        self.timezone = self.timezone.trim().to_string();
        self.language_code = self.language_code.to_ascii_lowercase();
    }
}

pub(crate) fn validate_timezone(timezone: &str) -> Result<(), SettingsError> {
    if timezone.trim().is_empty() {
        return Err(SettingsError::Validation("timezone cannot be empty"));
    }
    Ok(())
}

pub(crate) fn validate_language_code(code: &str) -> Result<(), SettingsError> {
    if code.chars().count() != LANGUAGE_CODE_LEN {
        return Err(SettingsError::Validation(
            "languageCode must be exactly 2 characters",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn span_check_tolerates_float_rounding() {
        let settings = Settings {
            min_temp: 15.55,
            max_temp: 15.55 + MIN_TEMP_SPAN,
            target_temp: 15.8,
            eco_temp: 15.8,
            ..Settings::default()
        };
        settings.validate().unwrap();

        let narrow = Settings {
            max_temp: 15.9,
            ..settings
        };
        assert!(narrow.validate().is_err());
    }

    #[test]
    fn active_target_follows_mode() {
        let mut settings = Settings::default();
        settings.mode = ThermostatMode::On;
        assert_eq!(settings.active_target_temp(), 20.5);
        settings.mode = ThermostatMode::Eco;
        assert_eq!(settings.active_target_temp(), 16.0);
    }

    #[test]
    fn rejects_inverted_range() {
        let settings = Settings {
            min_temp: 30.0,
            max_temp: 20.0,
            target_temp: 25.0,
            eco_temp: 25.0,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Validation(_))
        ));
    }

    #[test]
    fn rejects_setpoint_outside_range() {
        let settings = Settings {
            target_temp: 40.0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            eco_temp: 5.0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_non_finite_and_locale_errors() {
        let settings = Settings {
            temp_offset: f32::NAN,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            timezone: "  ".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            language_code: "eng".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn settings_json_uses_api_field_names() {
        let value = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(value["targetTemp"], 20.5);
        assert_eq!(value["mode"], "off");
        assert_eq!(value["languageCode"], "nl");
        assert_eq!(value["epdRefreshRate"], 60);
    }
}
