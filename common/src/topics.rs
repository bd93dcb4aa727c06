//! Home Assistant MQTT topics. Everything hangs off
//! `homeassistant/climate/<device_id>`.

pub const DEFAULT_DEVICE_ID: &str = "thermostat";
pub const DEVICE_NAME: &str = "ESP Thermostat";

pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub device_id: String,
    pub state: String,
    pub command: String,
    pub availability: String,
    pub set_temperature: String,
    pub set_mode: String,
    pub set_preset: String,
}

impl Topics {
    pub fn new(device_id: &str) -> Self {
        let base = format!("homeassistant/climate/{device_id}");
        let command = format!("{base}/set");
        Self {
            device_id: device_id.to_string(),
            state: format!("{base}/state"),
            availability: format!("{base}/availability"),
            set_temperature: format!("{command}/temperature"),
            set_mode: format!("{command}/mode"),
            set_preset: format!("{command}/preset"),
            command,
        }
    }

    /// Wildcard covering every command topic.
    pub fn command_filter(&self) -> String {
        format!("{}/#", self.command)
    }

    pub fn climate_discovery(&self) -> String {
        format!("homeassistant/climate/{}/config", self.device_id)
    }

    pub fn humidity_discovery(&self) -> String {
        format!("homeassistant/sensor/{}_humidity/config", self.device_id)
    }

    pub fn temperature_discovery(&self) -> String {
        format!("homeassistant/sensor/{}_temperature/config", self.device_id)
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_home_assistant_layout() {
        let topics = Topics::default();
        assert_eq!(topics.state, "homeassistant/climate/thermostat/state");
        assert_eq!(
            topics.set_temperature,
            "homeassistant/climate/thermostat/set/temperature"
        );
        assert_eq!(topics.command_filter(), "homeassistant/climate/thermostat/set/#");
        assert_eq!(
            topics.humidity_discovery(),
            "homeassistant/sensor/thermostat_humidity/config"
        );
    }
}
