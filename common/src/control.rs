//! Time-gated control loop around [`ThermostatEngine`]: samples the climate
//! sensor, ticks the engine and drives the heater output.

use tracing::{debug, error, info, warn};

use crate::{
    config::{Settings, ThermostatConfig},
    error::{HeaterError, SensorError},
    thermostat::{EngineAction, ThermostatEngine},
    types::ThermostatStatus,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub temperature: f32,
    pub humidity: f32,
}

pub trait ClimateSensor {
    fn begin(&mut self) -> Result<(), SensorError>;
    fn read(&mut self) -> Result<SensorReading, SensorError>;
}

/// Single active-high output switching the heating element.
pub trait HeaterOutput {
    fn set_energized(&mut self, on: bool) -> Result<(), HeaterError>;
}

pub struct Thermostat<S, H> {
    engine: ThermostatEngine,
    sensor: S,
    heater: H,
    last_control_ms: Option<u64>,
    last_sample_ms: Option<u64>,
}

impl<S: ClimateSensor, H: HeaterOutput> Thermostat<S, H> {
    pub fn new(config: ThermostatConfig, sensor: S, heater: H) -> Self {
        Self {
            engine: ThermostatEngine::new(config),
            sensor,
            heater,
            last_control_ms: None,
            last_sample_ms: None,
        }
    }

    /// Brings up the sensor and drives the heater low. A sensor error is
    /// returned for the caller to retry.
    pub fn begin(&mut self) -> Result<(), SensorError> {
        let actions = self.engine.force_off();
        self.apply(actions);
        self.sensor.begin()?;
        info!("climate sensor initialized");
        Ok(())
    }

    /// One cooperative step. Sampling and control run only when their own
    /// interval has elapsed.
    pub fn update(&mut self, now_ms: u64, settings: &Settings) {
        if is_due(self.last_sample_ms, now_ms, self.engine.config.sensor_interval_ms) {
            self.last_sample_ms = Some(now_ms);
            self.sample(now_ms);
        }

        if is_due(self.last_control_ms, now_ms, self.engine.config.control_interval_ms) {
            self.last_control_ms = Some(now_ms);
            let actions = self.engine.tick(now_ms, settings);
            self.apply(actions);
        }
    }

    pub fn status(&self) -> ThermostatStatus {
        self.engine.status()
    }

    pub fn current_temp(&self, temp_offset: f32) -> f32 {
        self.engine.current_temp(temp_offset)
    }

    pub fn current_humidity(&self) -> f32 {
        self.engine.current_humidity()
    }

    pub fn is_heater_active(&self) -> bool {
        self.engine.is_heater_active()
    }

    pub fn engine(&self) -> &ThermostatEngine {
        &self.engine
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    pub fn heater(&self) -> &H {
        &self.heater
    }

    fn sample(&mut self, now_ms: u64) {
        match self.sensor.read().and_then(|reading| self.check_plausible(reading)) {
            Ok(reading) => {
                debug!(
                    "sensor: {:.1}C {:.1}%",
                    reading.temperature, reading.humidity
                );
                self.engine
                    .update_sensor_data(reading.temperature, reading.humidity, now_ms);
            }
            Err(err) => {
                self.engine.record_sensor_failure();
                warn!(
                    "discarding sensor sample ({} failures so far): {err}",
                    self.engine.sensor_failures()
                );
            }
        }
    }

    fn check_plausible(&self, reading: SensorReading) -> Result<SensorReading, SensorError> {
        let config = &self.engine.config;
        let temp_ok = reading.temperature.is_finite()
            && (config.min_valid_temp_c..=config.max_valid_temp_c).contains(&reading.temperature);
        let humidity_ok =
            reading.humidity.is_finite() && (0.0..=100.0).contains(&reading.humidity);
        if temp_ok && humidity_ok {
            Ok(reading)
        } else {
            Err(SensorError::OutOfRange {
                temperature: reading.temperature,
                humidity: reading.humidity,
            })
        }
    }

    fn apply(&mut self, actions: Vec<EngineAction>) {
        for action in actions {
            let on = matches!(action, EngineAction::HeaterOn);
            match self.heater.set_energized(on) {
                Ok(()) => info!("heater {}", if on { "on" } else { "off" }),
                Err(err) => {
                    error!("{err}");
                    self.engine.heater_fault();
                }
            }
        }
    }
}

fn is_due(last_ms: Option<u64>, now_ms: u64, interval_ms: u64) -> bool {
    last_ms
        .map(|last| now_ms.saturating_sub(last) >= interval_ms)
        .unwrap_or(true)
}
