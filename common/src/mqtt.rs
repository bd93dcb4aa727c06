//! Home Assistant climate bridge: state mapping, command handling and the
//! publish-on-change poller. Transport lives in the controller.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    config::{Settings, ThermostatConfig},
    error::SettingsError,
    settings::SettingsStore,
    storage::SettingsStorage,
    topics::{Topics, DEVICE_NAME},
    types::{ClimateSnapshot, ThermostatMode},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HaState {
    pub current_temperature: f32,
    pub temperature: f32,
    pub mode: &'static str,
    pub preset: &'static str,
    pub humidity: f32,
    pub action: &'static str,
}

impl From<&ClimateSnapshot> for HaState {
    fn from(snapshot: &ClimateSnapshot) -> Self {
        let (mode, preset) = ha_mode_and_preset(snapshot.mode);
        Self {
            current_temperature: round_tenth(snapshot.current_temp),
            temperature: round_tenth(snapshot.target_temp),
            mode,
            preset,
            humidity: round_tenth(snapshot.humidity),
            action: if snapshot.heating { "heating" } else { "idle" },
        }
    }
}

pub fn ha_mode_and_preset(mode: ThermostatMode) -> (&'static str, &'static str) {
    match mode {
        ThermostatMode::Off => ("off", "comfort"),
        ThermostatMode::Eco => ("heat", "eco"),
        ThermostatMode::On => ("heat", "comfort"),
    }
}

fn round_tenth(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

pub struct MqttBridge {
    topics: Topics,
    poll_interval_ms: u64,
    last_poll_ms: Option<u64>,
    last_published: Option<ClimateSnapshot>,
    poll_now: bool,
    force_publish: bool,
}

impl MqttBridge {
    pub fn new(topics: Topics, config: &ThermostatConfig) -> Self {
        Self {
            topics,
            poll_interval_ms: config.mqtt_poll_interval_ms,
            last_poll_ms: None,
            last_published: None,
            poll_now: false,
            force_publish: false,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Call after (re)connecting so the next poll publishes unconditionally.
    pub fn on_connected(&mut self) {
        self.last_published = None;
        self.poll_now = true;
    }

    /// Returns the state document to publish, if the poll is due and anything
    /// changed since the last publish (or a republish was forced).
    pub fn poll(&mut self, now_ms: u64, snapshot: ClimateSnapshot) -> Option<HaState> {
        let due = self.poll_now
            || self
                .last_poll_ms
                .map(|last| now_ms.saturating_sub(last) >= self.poll_interval_ms)
                .unwrap_or(true);
        if !due {
            return None;
        }
        self.last_poll_ms = Some(now_ms);
        self.poll_now = false;

        let changed = self.last_published != Some(snapshot);
        if !changed && !self.force_publish {
            return None;
        }
        self.force_publish = false;
        self.last_published = Some(snapshot);
        Some(HaState::from(&snapshot))
    }

    pub fn handle_message<S: SettingsStorage>(
        &mut self,
        store: &mut SettingsStore<S>,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), SettingsError> {
        let payload = String::from_utf8_lossy(payload);
        let payload = payload.trim();
        debug!("mqtt command on {topic}: {payload}");

        if topic == self.topics.set_temperature {
            self.poll_now = true;
            if store.mode() == ThermostatMode::Eco {
                warn!("temperature command ignored in eco mode");
                self.force_publish = true;
                return Ok(());
            }
            match payload.parse::<f32>() {
                Ok(temp) if temp.is_finite() => store.set_target_temp(temp)?,
                _ => {
                    warn!("invalid temperature payload `{payload}`");
                    self.force_publish = true;
                }
            }
        } else if topic == self.topics.set_mode {
            self.poll_now = true;
            match payload.to_ascii_lowercase().as_str() {
                "off" => store.set_mode(ThermostatMode::Off)?,
                "heat" => store.set_mode(ThermostatMode::On)?,
                other => {
                    warn!("unsupported mode `{other}`");
                    self.force_publish = true;
                }
            }
        } else if topic == self.topics.set_preset {
            self.poll_now = true;
            let active = store.mode() != ThermostatMode::Off;
            match payload.to_ascii_lowercase().as_str() {
                "eco" if active => store.set_mode(ThermostatMode::Eco)?,
                "comfort" if active => store.set_mode(ThermostatMode::On)?,
                other => {
                    info!("preset `{other}` not applicable in mode {}", store.mode());
                    self.force_publish = true;
                }
            }
        } else {
            debug!("ignoring message on unrelated topic {topic}");
        }
        Ok(())
    }

    pub fn climate_discovery(&self, settings: &Settings) -> Value {
        let topics = &self.topics;
        json!({
            "name": DEVICE_NAME,
            "unique_id": format!("{}_climate", topics.device_id),
            "device": device_block(topics, true),
            "state_topic": topics.state,
            "command_topic": topics.command,
            "availability_topic": topics.availability,
            "current_temperature_topic": topics.state,
            "current_temperature_template": "{{ value_json.current_temperature }}",
            "temperature_state_topic": topics.state,
            "temperature_state_template": "{{ value_json.temperature }}",
            "temperature_command_topic": topics.set_temperature,
            "current_humidity_topic": topics.state,
            "current_humidity_template": "{{ value_json.humidity }}",
            "mode_state_topic": topics.state,
            "mode_state_template": "{{ value_json.mode }}",
            "mode_command_topic": topics.set_mode,
            "modes": ["off", "heat"],
            "preset_mode_state_topic": topics.state,
            "preset_mode_value_template": "{{ value_json.preset }}",
            "preset_mode_command_topic": topics.set_preset,
            "preset_modes": ["comfort", "eco"],
            "min_temp": settings.min_temp,
            "max_temp": settings.max_temp,
            "temp_step": 0.5,
            "temperature_unit": "C",
            "action_topic": topics.state,
            "action_template": "{{ value_json.action }}",
            "optimistic": false,
        })
    }

    /// Discovery documents for the standalone humidity and temperature
    /// sensors, as `(topic, payload)` pairs.
    pub fn sensor_discovery(&self) -> [(String, Value); 2] {
        let topics = &self.topics;
        [
            (
                topics.humidity_discovery(),
                json!({
                    "name": format!("{DEVICE_NAME} Humidity"),
                    "unique_id": format!("{}_humidity", topics.device_id),
                    "state_topic": topics.state,
                    "value_template": "{{ value_json.humidity }}",
                    "unit_of_measurement": "%",
                    "device_class": "humidity",
                    "device": device_block(topics, false),
                }),
            ),
            (
                topics.temperature_discovery(),
                json!({
                    "name": format!("{DEVICE_NAME} Temperature"),
                    "unique_id": format!("{}_temperature", topics.device_id),
                    "state_topic": topics.state,
                    "value_template": "{{ value_json.current_temperature }}",
                    "unit_of_measurement": "°C",
                    "device_class": "temperature",
                    "device": device_block(topics, false),
                }),
            ),
        ]
    }
}

fn device_block(topics: &Topics, full: bool) -> Value {
    if full {
        json!({
            "identifiers": [topics.device_id],
            "name": DEVICE_NAME,
            "model": DEVICE_NAME,
            "manufacturer": "ablos",
        })
    } else {
        json!({ "identifiers": [topics.device_id] })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{storage::MemoryStorage, types::ThermostatStatus};

    fn store() -> SettingsStore<MemoryStorage> {
        let mut store = SettingsStore::new(MemoryStorage::new());
        store.initialize().unwrap();
        store
    }

    fn bridge() -> MqttBridge {
        MqttBridge::new(Topics::default(), &ThermostatConfig::default())
    }

    fn snapshot(store: &SettingsStore<MemoryStorage>) -> ClimateSnapshot {
        let status = ThermostatStatus {
            current_temp: 19.04,
            current_humidity: 48.26,
            heater_active: true,
            ..ThermostatStatus::default()
        };
        ClimateSnapshot::capture(store.settings(), &status)
    }

    #[test]
    fn state_maps_modes_and_rounds() {
        let mut store = store();
        store.set_mode(ThermostatMode::Eco).unwrap();

        let state = HaState::from(&snapshot(&store));

        assert_eq!(
            state,
            HaState {
                current_temperature: 19.0,
                temperature: 16.0,
                mode: "heat",
                preset: "eco",
                humidity: 48.3,
                action: "heating",
            }
        );
        assert_eq!(ha_mode_and_preset(ThermostatMode::Off), ("off", "comfort"));
        assert_eq!(ha_mode_and_preset(ThermostatMode::On), ("heat", "comfort"));
    }

    #[test]
    fn state_json_field_names() {
        let store = store();
        let value = serde_json::to_value(HaState::from(&snapshot(&store))).unwrap();
        assert_eq!(value["action"], "heating");
        assert_eq!(value["mode"], "off");
        assert!(value.get("current_temperature").is_some());
    }

    #[test]
    fn publishes_only_on_change_within_interval() {
        let store = store();
        let mut bridge = bridge();
        let snap = snapshot(&store);

        assert!(bridge.poll(0, snap).is_some());
        assert!(bridge.poll(1_000, snap).is_none());
        assert!(bridge.poll(2_000, snap).is_none());

        let warmer = ClimateSnapshot {
            current_temp: 19.5,
            ..snap
        };
        assert!(bridge.poll(3_000, warmer).is_none());
        assert!(bridge.poll(4_000, warmer).is_some());
    }

    #[test]
    fn temperature_command_applies_and_polls_immediately() {
        let mut store = store();
        store.set_mode(ThermostatMode::On).unwrap();
        let mut bridge = bridge();
        let _ = bridge.poll(0, snapshot(&store));

        let topic = bridge.topics().set_temperature.clone();
        bridge.handle_message(&mut store, &topic, b"22.5").unwrap();

        assert_eq!(store.target_temp(), 22.5);
        let state = bridge.poll(100, snapshot(&store)).unwrap();
        assert_eq!(state.temperature, 22.5);
    }

    #[test]
    fn temperature_command_rejected_in_eco_forces_republish() {
        let mut store = store();
        store.set_mode(ThermostatMode::Eco).unwrap();
        let mut bridge = bridge();
        let _ = bridge.poll(0, snapshot(&store));

        let topic = bridge.topics().set_temperature.clone();
        bridge.handle_message(&mut store, &topic, b"25").unwrap();

        assert_eq!(store.target_temp(), 20.5);
        let state = bridge.poll(100, snapshot(&store)).unwrap();
        assert_eq!(state.temperature, 16.0);
        assert!(bridge.poll(200, snapshot(&store)).is_none());
    }

    #[test]
    fn mode_commands_translate_home_assistant_modes() {
        let mut store = store();
        let mut bridge = bridge();
        let topic = bridge.topics().set_mode.clone();

        bridge.handle_message(&mut store, &topic, b"HEAT").unwrap();
        assert_eq!(store.mode(), ThermostatMode::On);

        bridge.handle_message(&mut store, &topic, b"cool").unwrap();
        assert_eq!(store.mode(), ThermostatMode::On);

        bridge.handle_message(&mut store, &topic, b"off").unwrap();
        assert_eq!(store.mode(), ThermostatMode::Off);
    }

    #[test]
    fn presets_only_apply_when_heating_enabled() {
        let mut store = store();
        let mut bridge = bridge();
        let topic = bridge.topics().set_preset.clone();

        bridge.handle_message(&mut store, &topic, b"eco").unwrap();
        assert_eq!(store.mode(), ThermostatMode::Off);

        store.set_mode(ThermostatMode::On).unwrap();
        bridge.handle_message(&mut store, &topic, b"eco").unwrap();
        assert_eq!(store.mode(), ThermostatMode::Eco);

        bridge.handle_message(&mut store, &topic, b"comfort").unwrap();
        assert_eq!(store.mode(), ThermostatMode::On);
    }

    #[test]
    fn discovery_points_at_command_topics() {
        let store = store();
        let bridge = bridge();

        let climate = bridge.climate_discovery(store.settings());
        assert_eq!(
            climate["temperature_command_topic"],
            "homeassistant/climate/thermostat/set/temperature"
        );
        assert_eq!(climate["min_temp"], 10.0);

        let [(humidity_topic, humidity), _] = bridge.sensor_discovery();
        assert_eq!(
            humidity_topic,
            "homeassistant/sensor/thermostat_humidity/config"
        );
        assert_eq!(humidity["device_class"], "humidity");
    }
}
