pub mod api;
pub mod buttons;
pub mod config;
pub mod control;
pub mod display;
pub mod error;
pub mod mqtt;
pub mod settings;
pub mod storage;
pub mod thermostat;
pub mod topics;
pub mod types;

pub use api::{ApiError, ErrorBody, SettingField};
pub use buttons::{handle_button, ButtonEvent};
pub use config::{Settings, ThermostatConfig};
pub use control::{ClimateSensor, HeaterOutput, SensorReading, Thermostat};
pub use display::{DisplayFrame, DisplayPolicy};
pub use error::{HeaterError, SensorError, SettingsError, StorageError};
pub use mqtt::{HaState, MqttBridge};
pub use settings::SettingsStore;
pub use storage::{FileStorage, MemoryStorage, SettingsStorage, StoredValue};
pub use thermostat::{EngineAction, ThermostatEngine};
pub use topics::Topics;
pub use types::{ClimateSnapshot, ControlState, StatusPayload, ThermostatMode, ThermostatStatus};
