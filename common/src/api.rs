//! Request handling shared by the host and ESP HTTP servers. Handlers here
//! take raw bodies and return JSON documents; status codes come from
//! [`ApiError::status_code`].

use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::{
    config::Settings,
    error::SettingsError,
    settings::SettingsStore,
    storage::SettingsStorage,
    types::{StatusPayload, ThermostatMode, ThermostatStatus},
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl ApiError {
    fn bad_request(message: &str) -> Self {
        Self::BadRequest(message.to_string())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Internal(_) => 500,
            Self::Settings(SettingsError::NotInitialized) => 503,
            Self::Settings(SettingsError::InvalidMode(_) | SettingsError::Validation(_)) => 400,
            Self::Settings(SettingsError::Storage(_)) => 500,
        }
    }

    /// Client-facing text. Storage details stay in the log.
    pub fn message(&self) -> String {
        match self {
            Self::BadRequest(message) => message.clone(),
            Self::Internal(_) | Self::Settings(SettingsError::Storage(_)) => {
                "Failed to set value".to_string()
            }
            Self::Settings(SettingsError::NotInitialized) => {
                "Data manager not initialized".to_string()
            }
            Self::Settings(SettingsError::InvalidMode(_)) => "Invalid mode".to_string(),
            Self::Settings(SettingsError::Validation(message)) => message.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Settings(err) if err.is_fatal())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub error: String,
}

impl From<&ApiError> for ErrorBody {
    fn from(err: &ApiError) -> Self {
        Self {
            status: "error",
            error: err.message(),
        }
    }
}

/// Individually addressable settings, keyed by their JSON field name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingField {
    TargetTemp,
    EcoTemp,
    MaxTemp,
    MinTemp,
    Mode,
}

impl SettingField {
    pub fn key(self) -> &'static str {
        match self {
            Self::TargetTemp => "targetTemp",
            Self::EcoTemp => "ecoTemp",
            Self::MaxTemp => "maxTemp",
            Self::MinTemp => "minTemp",
            Self::Mode => "mode",
        }
    }
}

pub fn status_payload<S: SettingsStorage>(
    store: &SettingsStore<S>,
    status: &ThermostatStatus,
    uptime_s: u64,
) -> StatusPayload {
    let ready = store.is_ready();
    StatusPayload {
        status: "ok",
        uptime: uptime_s,
        target_temp: ready.then(|| store.target_temp()),
        eco_temp: ready.then(|| store.eco_temp()),
        mode: ready.then(|| store.mode().as_str()),
        max_temp: ready.then(|| store.max_temp()),
        min_temp: ready.then(|| store.min_temp()),
        current_temp: status.current_temp + store.temp_offset(),
        humidity: status.current_humidity,
        heater_active: status.heater_active,
        sensor_fault: status.sensor_fault,
        state: status.state.as_str(),
    }
}

/// `{"status":"ok", key: value}` for a live reading.
pub fn reading<S: SettingsStorage>(
    store: &SettingsStore<S>,
    key: &str,
    value: f32,
) -> Result<Value, ApiError> {
    ensure_ready(store)?;
    Ok(single(key, value.into()))
}

pub fn read_setting<S: SettingsStorage>(
    store: &SettingsStore<S>,
    field: SettingField,
) -> Result<Value, ApiError> {
    ensure_ready(store)?;
    let value = match field {
        SettingField::TargetTemp => store.target_temp().into(),
        SettingField::EcoTemp => store.eco_temp().into(),
        SettingField::MaxTemp => store.max_temp().into(),
        SettingField::MinTemp => store.min_temp().into(),
        SettingField::Mode => store.mode().as_str().into(),
    };
    Ok(single(field.key(), value))
}

/// Applies `{ "<key>": value }`. Temperatures are clamped by the store; modes
/// outside the fixed set are rejected before they reach it.
pub fn write_setting<S: SettingsStorage>(
    store: &mut SettingsStore<S>,
    field: SettingField,
    body: &[u8],
) -> Result<(), ApiError> {
    let value = body_field(body, field.key())?;

    if field == SettingField::Mode {
        let mode = value
            .as_str()
            .and_then(|raw| raw.parse::<ThermostatMode>().ok())
            .ok_or_else(|| ApiError::bad_request("Invalid mode"))?;
        store.set_mode(mode)?;
        return Ok(());
    }

    let temp = value
        .as_f64()
        .map(|value| value as f32)
        .ok_or_else(|| ApiError::bad_request("Invalid value"))?;
    match field {
        SettingField::TargetTemp => store.set_target_temp(temp)?,
        SettingField::EcoTemp => store.set_eco_temp(temp)?,
        SettingField::MaxTemp => store.set_max_temp(temp)?,
        SettingField::MinTemp => store.set_min_temp(temp)?,
        SettingField::Mode => {}
    }
    Ok(())
}

pub fn settings_body<S: SettingsStorage>(store: &SettingsStore<S>) -> Result<Value, ApiError> {
    ensure_ready(store)?;
    let settings = serde_json::to_value(store.settings())
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(json!({ "status": "ok", "settings": settings }))
}

/// Fields missing from the body keep their current value; the merged record
/// is applied only if it passes validation as a whole.
pub fn merge_settings<S: SettingsStorage>(
    store: &mut SettingsStore<S>,
    body: &[u8],
) -> Result<(), ApiError> {
    let Ok(Value::Object(update)) = serde_json::from_slice::<Value>(body) else {
        return Err(ApiError::bad_request("Invalid JSON"));
    };
    ensure_ready(store)?;

    let mut merged = match serde_json::to_value(store.settings()) {
        Ok(Value::Object(current)) => current,
        Ok(_) => return Err(ApiError::Internal("settings are not an object".to_string())),
        Err(err) => return Err(ApiError::Internal(err.to_string())),
    };
    merged.extend(update);

    let candidate = serde_json::from_value::<Settings>(Value::Object(merged))
        .map_err(|err| ApiError::BadRequest(format!("Invalid settings: {err}")))?;
    store.update_settings(&candidate)?;
    Ok(())
}

fn body_field(body: &[u8], key: &str) -> Result<Value, ApiError> {
    let Ok(Value::Object(mut doc)) = serde_json::from_slice::<Value>(body) else {
        return Err(ApiError::bad_request("Invalid JSON"));
    };
    doc.remove(key)
        .ok_or_else(|| ApiError::bad_request("Missing field"))
}

fn ensure_ready<S: SettingsStorage>(store: &SettingsStore<S>) -> Result<(), ApiError> {
    if store.is_ready() {
        Ok(())
    } else {
        Err(SettingsError::NotInitialized.into())
    }
}

fn single(key: &str, value: Value) -> Value {
    let mut body = Map::new();
    body.insert("status".to_string(), "ok".into());
    body.insert(key.to_string(), value);
    Value::Object(body)
}
