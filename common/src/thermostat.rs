use tracing::{info, warn};

use crate::{
    config::{Settings, ThermostatConfig},
    types::{ControlState, ThermostatMode, ThermostatStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    HeaterOn,
    HeaterOff,
}

/// Hysteresis controller. Pure: callers feed readings and time, and execute
/// the returned actions against the actuator.
#[derive(Debug, Clone)]
pub struct ThermostatEngine {
    pub config: ThermostatConfig,
    status: ThermostatStatus,

    /// Last level driven onto the actuator. `None` until the first action or
    /// after the output reported a failure, so the next tick re-drives it.
    heater_on: Option<bool>,

    last_sensor_update_ms: Option<u64>,
    sensor_failures: u32,
}

impl ThermostatEngine {
    pub fn new(config: ThermostatConfig) -> Self {
        Self {
            config,
            status: ThermostatStatus::default(),
            heater_on: None,
            last_sensor_update_ms: None,
            sensor_failures: 0,
        }
    }

    pub fn status(&self) -> ThermostatStatus {
        self.status
    }

    /// Corrected temperature as reported to every consumer.
    pub fn current_temp(&self, temp_offset: f32) -> f32 {
        self.status.current_temp + temp_offset
    }

    pub fn current_humidity(&self) -> f32 {
        self.status.current_humidity
    }

    pub fn is_heater_active(&self) -> bool {
        self.status.heater_active
    }

    pub fn is_heater_energized(&self) -> bool {
        self.heater_on.unwrap_or(false)
    }

    pub fn sensor_failures(&self) -> u32 {
        self.sensor_failures
    }

    pub fn update_sensor_data(&mut self, temp_c: f32, humidity: f32, now_ms: u64) {
        self.status.current_temp = temp_c;
        self.status.current_humidity = humidity;
        self.last_sensor_update_ms = Some(now_ms);
        if self.status.sensor_fault {
            info!("sensor readings recovered");
            self.status.sensor_fault = false;
        }
    }

    pub fn record_sensor_failure(&mut self) {
        self.sensor_failures = self.sensor_failures.saturating_add(1);
    }

    pub fn is_sensor_data_valid(&self, now_ms: u64) -> bool {
        self.last_sensor_update_ms
            .map(|last| now_ms.saturating_sub(last) < self.config.sensor_stale_timeout_ms)
            .unwrap_or(false)
    }

    pub fn last_sensor_update_ms(&self) -> Option<u64> {
        self.last_sensor_update_ms
    }

    /// Drives the actuator low unconditionally.
    pub fn force_off(&mut self) -> Vec<EngineAction> {
        self.status.heater_active = false;
        self.status.state = ControlState::Off;
        self.heater_on = Some(false);
        vec![EngineAction::HeaterOff]
    }

    /// Forgets the actuator level after a failed write.
    pub fn heater_fault(&mut self) {
        self.heater_on = None;
    }

    pub fn tick(&mut self, now_ms: u64, settings: &Settings) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        if settings.mode == ThermostatMode::Off {
            self.status.heater_active = false;
            self.status.state = ControlState::Off;
            self.switch_heater(false, &mut actions);
            return actions;
        }

        if !self.is_sensor_data_valid(now_ms) {
            if !self.status.sensor_fault {
                warn!(
                    "no valid sensor reading for {}ms; forcing heater off",
                    self.config.sensor_stale_timeout_ms
                );
                self.status.sensor_fault = true;
            }
            self.status.heater_active = false;
            self.status.state = ControlState::Idle;
            self.switch_heater(false, &mut actions);
            return actions;
        }

        let temp = self.current_temp(settings.temp_offset);
        let target = settings.active_target_temp();

        if temp < target - settings.hysteresis {
            self.status.heater_active = true;
            self.switch_heater(true, &mut actions);
        } else if temp >= target {
            self.switch_heater(false, &mut actions);
            if temp > target + self.config.active_release_band {
                self.status.heater_active = false;
            }
        } else if self.heater_on.is_none() {
            self.switch_heater(false, &mut actions);
        }

        self.status.state = if self.is_heater_energized() {
            ControlState::BelowBand
        } else if self.status.heater_active {
            ControlState::AboveBand
        } else {
            ControlState::Idle
        };

        actions
    }

    fn switch_heater(&mut self, on: bool, actions: &mut Vec<EngineAction>) {
        if self.heater_on == Some(on) {
            return;
        }
        actions.push(if on {
            EngineAction::HeaterOn
        } else {
            EngineAction::HeaterOff
        });
        self.heater_on = Some(on);
    }
}
