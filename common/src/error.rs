use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage namespace `{0}` could not be opened: {1}")]
    Open(String, String),
    #[error("storage is not open")]
    NotOpen,
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value for `{0}` has the wrong type")]
    TypeMismatch(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings store is not initialized")]
    NotInitialized,
    /// Mode strings outside the fixed set. Reaching the store with one of these
    /// means parsing was bypassed or memory is corrupt.
    #[error("invalid thermostat mode `{0}`")]
    InvalidMode(String),
    #[error("invalid settings: {0}")]
    Validation(&'static str),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SettingsError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidMode(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    #[error("sensor initialization failed: {0}")]
    Init(String),
    #[error("sensor read failed: {0}")]
    Read(String),
    #[error("implausible reading {temperature:.1}C / {humidity:.1}%")]
    OutOfRange { temperature: f32, humidity: f32 },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("heater output failed: {0}")]
pub struct HeaterError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invalid_mode_is_fatal() {
        assert!(SettingsError::InvalidMode("away".to_string()).is_fatal());
        assert!(!SettingsError::NotInitialized.is_fatal());
        assert!(!SettingsError::Validation("minTemp must be below maxTemp").is_fatal());
        assert!(!SettingsError::Storage(StorageError::NotOpen).is_fatal());
    }

    #[test]
    fn error_display() {
        let err = SettingsError::InvalidMode("away".to_string());
        assert_eq!(err.to_string(), "invalid thermostat mode `away`");

        let err = SensorError::OutOfRange {
            temperature: 120.0,
            humidity: 40.0,
        };
        assert!(err.to_string().contains("120.0C"));
    }
}
