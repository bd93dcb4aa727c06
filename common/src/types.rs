use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{config::Settings, error::SettingsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermostatMode {
    Off,
    Eco,
    On,
}

impl ThermostatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Eco => "eco",
            Self::On => "on",
        }
    }
}

impl fmt::Display for ThermostatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThermostatMode {
    type Err = SettingsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "off" => Ok(Self::Off),
            "eco" => Ok(Self::Eco),
            "on" => Ok(Self::On),
            other => Err(SettingsError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    Off,
    BelowBand,
    AboveBand,
    Idle,
}

impl ControlState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::BelowBand => "BELOW_BAND",
            Self::AboveBand => "ABOVE_BAND",
            Self::Idle => "IDLE",
        }
    }
}

/// Live readings owned by the control loop. `current_temp` is the raw sensor
/// value; the calibration offset is applied by readers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThermostatStatus {
    #[serde(rename = "currentTemp")]
    pub current_temp: f32,
    #[serde(rename = "currentHumidity")]
    pub current_humidity: f32,
    #[serde(rename = "heaterActive")]
    pub heater_active: bool,
    #[serde(rename = "sensorFault")]
    pub sensor_fault: bool,
    pub state: ControlState,
}

impl Default for ThermostatStatus {
    fn default() -> Self {
        Self {
            current_temp: 19.0,
            current_humidity: 40.0,
            heater_active: false,
            sensor_fault: false,
            state: ControlState::Off,
        }
    }
}

/// Corrected readings plus the active setpoint, as every outward surface
/// (MQTT, display) presents them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateSnapshot {
    pub current_temp: f32,
    pub target_temp: f32,
    pub humidity: f32,
    pub mode: ThermostatMode,
    pub heating: bool,
}

impl ClimateSnapshot {
    pub fn capture(settings: &Settings, status: &ThermostatStatus) -> Self {
        Self {
            current_temp: status.current_temp + settings.temp_offset,
            target_temp: settings.active_target_temp(),
            humidity: status.current_humidity,
            mode: settings.mode,
            heating: status.heater_active,
        }
    }
}

/// Document served by the status endpoint and returned after every setter.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub status: &'static str,
    pub uptime: u64,
    #[serde(rename = "targetTemp", skip_serializing_if = "Option::is_none")]
    pub target_temp: Option<f32>,
    #[serde(rename = "ecoTemp", skip_serializing_if = "Option::is_none")]
    pub eco_temp: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'static str>,
    #[serde(rename = "maxTemp", skip_serializing_if = "Option::is_none")]
    pub max_temp: Option<f32>,
    #[serde(rename = "minTemp", skip_serializing_if = "Option::is_none")]
    pub min_temp: Option<f32>,
    #[serde(rename = "currentTemp")]
    pub current_temp: f32,
    pub humidity: f32,
    #[serde(rename = "heaterActive")]
    pub heater_active: bool,
    #[serde(rename = "sensorFault")]
    pub sensor_fault: bool,
    pub state: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_only_fixed_values() {
        for mode in [ThermostatMode::Off, ThermostatMode::Eco, ThermostatMode::On] {
            assert_eq!(mode.as_str().parse::<ThermostatMode>().unwrap(), mode);
        }

        let err = "heat".parse::<ThermostatMode>().unwrap_err();
        assert!(matches!(err, SettingsError::InvalidMode(ref value) if value == "heat"));
        assert!("ON".parse::<ThermostatMode>().is_err());
    }

    #[test]
    fn mode_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ThermostatMode::Eco).unwrap(),
            "\"eco\""
        );
        assert!(serde_json::from_str::<ThermostatMode>("\"away\"").is_err());
    }
}
