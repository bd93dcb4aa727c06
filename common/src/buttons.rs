//! Front-panel gestures mapped onto settings changes. Gesture decoding
//! (debounce, click counting, long press) is the input driver's job.

use tracing::info;

use crate::{
    error::SettingsError, settings::SettingsStore, storage::SettingsStorage,
    types::ThermostatMode,
};

/// Setpoint change per click.
pub const TEMP_STEP: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    ModeClick,
    ModeLongPress,
    TempUp { clicks: u8 },
    TempDown { clicks: u8 },
}

pub fn handle_button<S: SettingsStorage>(
    store: &mut SettingsStore<S>,
    event: ButtonEvent,
) -> Result<(), SettingsError> {
    info!("button: {event:?}");
    match event {
        ButtonEvent::ModeClick => match store.mode() {
            ThermostatMode::On => store.set_mode(ThermostatMode::Eco),
            ThermostatMode::Eco => store.set_mode(ThermostatMode::On),
            ThermostatMode::Off => Ok(()),
        },
        ButtonEvent::ModeLongPress => match store.mode() {
            ThermostatMode::Off => store.set_mode(ThermostatMode::On),
            ThermostatMode::On | ThermostatMode::Eco => store.set_mode(ThermostatMode::Off),
        },
        ButtonEvent::TempUp { clicks } => nudge_target(store, f32::from(clicks) * TEMP_STEP),
        ButtonEvent::TempDown { clicks } => nudge_target(store, -f32::from(clicks) * TEMP_STEP),
    }
}

/// Only the comfort setpoint is adjustable, and only while in `on` mode.
fn nudge_target<S: SettingsStorage>(
    store: &mut SettingsStore<S>,
    delta: f32,
) -> Result<(), SettingsError> {
    if store.mode() != ThermostatMode::On {
        return Ok(());
    }
    store.set_target_temp(store.target_temp() + delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn store() -> SettingsStore<MemoryStorage> {
        let mut store = SettingsStore::new(MemoryStorage::new());
        store.initialize().unwrap();
        store
    }

    #[test]
    fn mode_click_toggles_comfort_and_eco() {
        let mut store = store();

        handle_button(&mut store, ButtonEvent::ModeClick).unwrap();
        assert_eq!(store.mode(), ThermostatMode::Off);

        store.set_mode(ThermostatMode::On).unwrap();
        handle_button(&mut store, ButtonEvent::ModeClick).unwrap();
        assert_eq!(store.mode(), ThermostatMode::Eco);
        handle_button(&mut store, ButtonEvent::ModeClick).unwrap();
        assert_eq!(store.mode(), ThermostatMode::On);
    }

    #[test]
    fn long_press_toggles_power() {
        let mut store = store();

        handle_button(&mut store, ButtonEvent::ModeLongPress).unwrap();
        assert_eq!(store.mode(), ThermostatMode::On);

        store.set_mode(ThermostatMode::Eco).unwrap();
        handle_button(&mut store, ButtonEvent::ModeLongPress).unwrap();
        assert_eq!(store.mode(), ThermostatMode::Off);
    }

    #[test]
    fn temp_buttons_step_by_half_degree_in_on_mode_only() {
        let mut store = store();

        handle_button(&mut store, ButtonEvent::TempUp { clicks: 2 }).unwrap();
        assert_eq!(store.target_temp(), 20.5);

        store.set_mode(ThermostatMode::On).unwrap();
        handle_button(&mut store, ButtonEvent::TempUp { clicks: 3 }).unwrap();
        assert_eq!(store.target_temp(), 22.0);

        handle_button(&mut store, ButtonEvent::TempDown { clicks: 1 }).unwrap();
        assert_eq!(store.target_temp(), 21.5);

        handle_button(&mut store, ButtonEvent::TempUp { clicks: 60 }).unwrap();
        assert_eq!(store.target_temp(), 35.0);
    }
}
