//! Simulated hardware for the host build: a room that warms while the heater
//! relay is closed and drifts back to ambient otherwise.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use thermostat_common::{ClimateSensor, HeaterError, HeaterOutput, SensorError, SensorReading};
use tracing::info;

const AMBIENT_C: f32 = 15.0;
const HEAT_GAIN_PER_SAMPLE: f32 = 0.15;
const LOSS_FACTOR: f32 = 0.02;

#[derive(Debug, Default)]
pub struct LoggingHeater {
    energized: Arc<AtomicBool>,
}

impl LoggingHeater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the relay state, for the simulated room.
    pub fn energized_flag(&self) -> Arc<AtomicBool> {
        self.energized.clone()
    }
}

impl HeaterOutput for LoggingHeater {
    fn set_energized(&mut self, on: bool) -> Result<(), HeaterError> {
        self.energized.store(on, Ordering::Relaxed);
        info!("heater relay {}", if on { "closed" } else { "open" });
        Ok(())
    }
}

#[derive(Debug)]
pub struct SimulatedRoom {
    temperature: f32,
    humidity: f32,
    heater: Arc<AtomicBool>,
}

impl SimulatedRoom {
    pub fn new(heater: Arc<AtomicBool>, start_temp: f32) -> Self {
        Self {
            temperature: start_temp,
            humidity: 45.0,
            heater,
        }
    }
}

impl ClimateSensor for SimulatedRoom {
    fn begin(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read(&mut self) -> Result<SensorReading, SensorError> {
        if self.heater.load(Ordering::Relaxed) {
            self.temperature += HEAT_GAIN_PER_SAMPLE;
        } else {
            self.temperature += (AMBIENT_C - self.temperature) * LOSS_FACTOR;
        }
        // Warmer air holds more moisture, so relative humidity drops.
        self.humidity = (45.0 - (self.temperature - 18.0) * 0.8).clamp(20.0, 80.0);

        Ok(SensorReading {
            temperature: self.temperature,
            humidity: self.humidity,
        })
    }
}
