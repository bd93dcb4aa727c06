//! Validating, persisting owner of the thermostat configuration.
//!
//! All writers (buttons, HTTP, MQTT) go through the setters here; each setter
//! clamps or rejects its input, persists the keys that changed and only then
//! commits the in-memory record.

use tracing::{error, info, warn};

use crate::{
    config::{
        validate_language_code, validate_timezone, Settings, ABSOLUTE_MAX_TEMP,
        ABSOLUTE_MIN_TEMP, MAX_HYSTERESIS, MIN_HYSTERESIS, MIN_TEMP_SPAN,
    },
    error::{SettingsError, StorageError},
    storage::SettingsStorage,
    types::ThermostatMode,
};

pub const NAMESPACE: &str = "thermostat";

pub mod keys {
    pub const INITIALIZED: &str = "initialized";
    pub const TARGET_TEMP: &str = "targetTemp";
    pub const ECO_TEMP: &str = "ecoTemp";
    pub const MODE: &str = "mode";
    pub const TEMP_OFFSET: &str = "tempOffset";
    pub const HYSTERESIS: &str = "hysteresis";
    pub const MIN_TEMP: &str = "minTemp";
    pub const MAX_TEMP: &str = "maxTemp";
    pub const EPD_REFRESH_RATE: &str = "epdRefreshRate";
    pub const TEMP_CHANGE_THRESHOLD: &str = "tempChangeThreshold";
    pub const HUMIDITY_CHANGE_THRESHOLD: &str = "humidityChangeThreshold";
    pub const TIMEZONE: &str = "timezone";
    pub const LANGUAGE_CODE: &str = "languageCode";

    pub const ALL: [&str; 13] = [
        INITIALIZED,
        TARGET_TEMP,
        ECO_TEMP,
        MODE,
        TEMP_OFFSET,
        HYSTERESIS,
        MIN_TEMP,
        MAX_TEMP,
        EPD_REFRESH_RATE,
        TEMP_CHANGE_THRESHOLD,
        HUMIDITY_CHANGE_THRESHOLD,
        TIMEZONE,
        LANGUAGE_CODE,
    ];
}

pub struct SettingsStore<S> {
    storage: S,
    settings: Settings,
    initialized: bool,
}

impl<S: SettingsStorage> SettingsStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            settings: Settings::default(),
            initialized: false,
        }
    }

    /// Opens storage and loads the record, writing defaults on first boot and
    /// falling back to them when the stored record does not validate.
    pub fn initialize(&mut self) -> Result<(), SettingsError> {
        self.storage.open(NAMESPACE)?;

        if self.storage.contains(keys::INITIALIZED)? {
            match self.load_record() {
                Ok(loaded) => {
                    self.settings = loaded;
                    info!("settings loaded from storage");
                }
                Err(err) => {
                    warn!("stored settings rejected ({err}); restoring defaults");
                    self.storage.clear()?;
                    self.write_defaults()?;
                }
            }
        } else {
            self.write_defaults()?;
            info!("default settings applied");
        }

        self.initialized = true;
        info!(
            "settings: mode={} target={:.1} eco={:.1} range={:.1}..{:.1} hysteresis={:.1}",
            self.settings.mode,
            self.settings.target_temp,
            self.settings.eco_temp,
            self.settings.min_temp,
            self.settings.max_temp,
            self.settings.hysteresis,
        );
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.initialized
    }

    /// Clears every persisted key and reapplies defaults. Does nothing before
    /// `initialize`.
    pub fn reset(&mut self) -> Result<(), SettingsError> {
        if !self.initialized {
            return Ok(());
        }
        self.storage.clear()?;
        self.write_defaults()?;
        info!("settings reset to defaults");
        Ok(())
    }

    /// Validates the whole candidate first and applies it only if every
    /// invariant holds, so a rejected update changes nothing.
    pub fn update_settings(&mut self, candidate: &Settings) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        candidate.validate()?;
        let mut next = candidate.clone();
        next.normalize_locale();
        self.commit(next)?;
        info!("settings updated in bulk");
        Ok(())
    }

    pub fn set_target_temp(&mut self, temp: f32) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        ensure_finite(temp)?;
        let mut next = self.settings.clone();
        next.target_temp = constrain(temp, next.min_temp, next.max_temp);
        self.commit(next)?;
        info!("target temperature set to {:.1}C", self.settings.target_temp);
        Ok(())
    }

    pub fn set_eco_temp(&mut self, temp: f32) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        ensure_finite(temp)?;
        let mut next = self.settings.clone();
        next.eco_temp = constrain(temp, next.min_temp, next.max_temp);
        self.commit(next)?;
        info!("eco temperature set to {:.1}C", self.settings.eco_temp);
        Ok(())
    }

    /// Lowers the floor freely, raises it at most to `max_temp - MIN_TEMP_SPAN`;
    /// setpoints below the new floor are pulled up to it.
    pub fn set_min_temp(&mut self, temp: f32) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        ensure_finite(temp)?;
        let mut next = self.settings.clone();
        next.min_temp = constrain(temp, ABSOLUTE_MIN_TEMP, next.max_temp - MIN_TEMP_SPAN);
        next.target_temp = next.target_temp.max(next.min_temp);
        next.eco_temp = next.eco_temp.max(next.min_temp);
        self.commit(next)?;
        info!("min temperature set to {:.1}C", self.settings.min_temp);
        Ok(())
    }

    pub fn set_max_temp(&mut self, temp: f32) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        ensure_finite(temp)?;
        let mut next = self.settings.clone();
        next.max_temp = constrain(temp, next.min_temp + MIN_TEMP_SPAN, ABSOLUTE_MAX_TEMP);
        next.target_temp = next.target_temp.min(next.max_temp);
        next.eco_temp = next.eco_temp.min(next.max_temp);
        self.commit(next)?;
        info!("max temperature set to {:.1}C", self.settings.max_temp);
        Ok(())
    }

    pub fn set_hysteresis(&mut self, hysteresis: f32) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        ensure_finite(hysteresis)?;
        let mut next = self.settings.clone();
        next.hysteresis = constrain(hysteresis, MIN_HYSTERESIS, MAX_HYSTERESIS);
        self.commit(next)?;
        info!("hysteresis set to {:.1}C", self.settings.hysteresis);
        Ok(())
    }

    pub fn set_temp_offset(&mut self, offset: f32) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        ensure_finite(offset)?;
        let mut next = self.settings.clone();
        next.temp_offset = offset;
        self.commit(next)?;
        info!("temperature offset set to {:.1}C", offset);
        Ok(())
    }

    pub fn set_mode(&mut self, mode: ThermostatMode) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        let mut next = self.settings.clone();
        next.mode = mode;
        self.commit(next)?;
        info!("thermostat mode set to {mode}");
        Ok(())
    }

    /// String entry point for modes. Anything outside `off`/`eco`/`on` is
    /// returned as a fatal [`SettingsError::InvalidMode`]; the device loop
    /// restarts on it.
    pub fn set_mode_str(&mut self, mode: &str) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        match mode.parse::<ThermostatMode>() {
            Ok(mode) => self.set_mode(mode),
            Err(err) => {
                error!("invalid mode `{mode}` reached the settings store");
                Err(err)
            }
        }
    }

    pub fn set_epd_refresh_rate(&mut self, seconds: u32) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        let mut next = self.settings.clone();
        next.epd_refresh_rate = seconds;
        self.commit(next)?;
        info!("display refresh rate set to {seconds}s");
        Ok(())
    }

    pub fn set_temp_change_threshold(&mut self, threshold: f32) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        ensure_threshold(threshold)?;
        let mut next = self.settings.clone();
        next.temp_change_threshold = threshold;
        self.commit(next)?;
        info!("temperature change threshold set to {threshold:.1}");
        Ok(())
    }

    pub fn set_humidity_change_threshold(&mut self, threshold: f32) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        ensure_threshold(threshold)?;
        let mut next = self.settings.clone();
        next.humidity_change_threshold = threshold;
        self.commit(next)?;
        info!("humidity change threshold set to {threshold:.1}");
        Ok(())
    }

    pub fn set_timezone(&mut self, timezone: &str) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        validate_timezone(timezone)?;
        let mut next = self.settings.clone();
        next.timezone = timezone.to_string();
        next.normalize_locale();
        self.commit(next)?;
        info!("timezone set to {}", self.settings.timezone);
        Ok(())
    }

    pub fn set_language_code(&mut self, code: &str) -> Result<(), SettingsError> {
        self.ensure_ready()?;
        validate_language_code(code)?;
        let mut next = self.settings.clone();
        next.language_code = code.to_string();
        next.normalize_locale();
        self.commit(next)?;
        info!("language code set to {}", self.settings.language_code);
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn target_temp(&self) -> f32 {
        self.settings.target_temp
    }

    pub fn eco_temp(&self) -> f32 {
        self.settings.eco_temp
    }

    pub fn active_target_temp(&self) -> f32 {
        self.settings.active_target_temp()
    }

    pub fn mode(&self) -> ThermostatMode {
        self.settings.mode
    }

    pub fn temp_offset(&self) -> f32 {
        self.settings.temp_offset
    }

    pub fn hysteresis(&self) -> f32 {
        self.settings.hysteresis
    }

    pub fn min_temp(&self) -> f32 {
        self.settings.min_temp
    }

    pub fn max_temp(&self) -> f32 {
        self.settings.max_temp
    }

    pub fn epd_refresh_rate(&self) -> u32 {
        self.settings.epd_refresh_rate
    }

    pub fn temp_change_threshold(&self) -> f32 {
        self.settings.temp_change_threshold
    }

    pub fn humidity_change_threshold(&self) -> f32 {
        self.settings.humidity_change_threshold
    }

    pub fn timezone(&self) -> &str {
        &self.settings.timezone
    }

    pub fn language_code(&self) -> &str {
        &self.settings.language_code
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    fn ensure_ready(&self) -> Result<(), SettingsError> {
        if self.initialized {
            Ok(())
        } else {
            Err(SettingsError::NotInitialized)
        }
    }

    fn write_defaults(&mut self) -> Result<(), StorageError> {
        let defaults = Settings::default();
        self.persist(&defaults, true)?;
        self.storage.set_bool(keys::INITIALIZED, true)?;
        self.settings = defaults;
        Ok(())
    }

    fn commit(&mut self, next: Settings) -> Result<(), SettingsError> {
        self.persist(&next, false)?;
        self.settings = next;
        Ok(())
    }

    /// Writes the keys whose value differs from the committed record, or every
    /// key when `all` is set.
    fn persist(&mut self, next: &Settings, all: bool) -> Result<(), StorageError> {
        let prev = &self.settings;
        let storage = &mut self.storage;
        let float_changed = |a: f32, b: f32| all || a.to_bits() != b.to_bits();

        if float_changed(prev.target_temp, next.target_temp) {
            storage.set_f32(keys::TARGET_TEMP, next.target_temp)?;
        }
        if float_changed(prev.eco_temp, next.eco_temp) {
            storage.set_f32(keys::ECO_TEMP, next.eco_temp)?;
        }
        if all || prev.mode != next.mode {
            storage.set_str(keys::MODE, next.mode.as_str())?;
        }
        if float_changed(prev.temp_offset, next.temp_offset) {
            storage.set_f32(keys::TEMP_OFFSET, next.temp_offset)?;
        }
        if float_changed(prev.hysteresis, next.hysteresis) {
            storage.set_f32(keys::HYSTERESIS, next.hysteresis)?;
        }
        if float_changed(prev.min_temp, next.min_temp) {
            storage.set_f32(keys::MIN_TEMP, next.min_temp)?;
        }
        if float_changed(prev.max_temp, next.max_temp) {
            storage.set_f32(keys::MAX_TEMP, next.max_temp)?;
        }
        if all || prev.epd_refresh_rate != next.epd_refresh_rate {
            storage.set_u32(keys::EPD_REFRESH_RATE, next.epd_refresh_rate)?;
        }
        if float_changed(prev.temp_change_threshold, next.temp_change_threshold) {
            storage.set_f32(keys::TEMP_CHANGE_THRESHOLD, next.temp_change_threshold)?;
        }
        if float_changed(prev.humidity_change_threshold, next.humidity_change_threshold) {
            storage.set_f32(
                keys::HUMIDITY_CHANGE_THRESHOLD,
                next.humidity_change_threshold,
            )?;
        }
        if all || prev.timezone != next.timezone {
            storage.set_str(keys::TIMEZONE, &next.timezone)?;
        }
        if all || prev.language_code != next.language_code {
            storage.set_str(keys::LANGUAGE_CODE, &next.language_code)?;
        }
        Ok(())
    }

    fn load_record(&self) -> Result<Settings, SettingsError> {
        let defaults = Settings::default();
        let mode = match self.load_str(keys::MODE) {
            Some(value) => value.parse::<ThermostatMode>()?,
            None => defaults.mode,
        };

        let settings = Settings {
            target_temp: self.load_f32(keys::TARGET_TEMP, defaults.target_temp),
            eco_temp: self.load_f32(keys::ECO_TEMP, defaults.eco_temp),
            mode,
            temp_offset: self.load_f32(keys::TEMP_OFFSET, defaults.temp_offset),
            hysteresis: self.load_f32(keys::HYSTERESIS, defaults.hysteresis),
            min_temp: self.load_f32(keys::MIN_TEMP, defaults.min_temp),
            max_temp: self.load_f32(keys::MAX_TEMP, defaults.max_temp),
            epd_refresh_rate: self.load_u32(keys::EPD_REFRESH_RATE, defaults.epd_refresh_rate),
            temp_change_threshold: self
                .load_f32(keys::TEMP_CHANGE_THRESHOLD, defaults.temp_change_threshold),
            humidity_change_threshold: self.load_f32(
                keys::HUMIDITY_CHANGE_THRESHOLD,
                defaults.humidity_change_threshold,
            ),
            timezone: self.load_str(keys::TIMEZONE).unwrap_or(defaults.timezone),
            language_code: self
                .load_str(keys::LANGUAGE_CODE)
                .unwrap_or(defaults.language_code),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn load_f32(&self, key: &str, fallback: f32) -> f32 {
        match self.storage.get_f32(key) {
            Ok(value) => value.unwrap_or(fallback),
            Err(err) => {
                warn!("falling back to default for `{key}`: {err}");
                fallback
            }
        }
    }

    fn load_u32(&self, key: &str, fallback: u32) -> u32 {
        match self.storage.get_u32(key) {
            Ok(value) => value.unwrap_or(fallback),
            Err(err) => {
                warn!("falling back to default for `{key}`: {err}");
                fallback
            }
        }
    }

    fn load_str(&self, key: &str) -> Option<String> {
        match self.storage.get_str(key) {
            Ok(value) => value,
            Err(err) => {
                warn!("falling back to default for `{key}`: {err}");
                None
            }
        }
    }
}

/// Clamp that never panics, even if the bounds cross.
fn constrain(value: f32, low: f32, high: f32) -> f32 {
    value.max(low).min(high)
}

fn ensure_finite(value: f32) -> Result<(), SettingsError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(SettingsError::Validation("value must be a finite number"))
    }
}

fn ensure_threshold(value: f32) -> Result<(), SettingsError> {
    ensure_finite(value)?;
    if value < 0.0 {
        return Err(SettingsError::Validation(
            "change thresholds must not be negative",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::storage::{MemoryStorage, StoredValue};

    fn ready_store() -> SettingsStore<MemoryStorage> {
        let mut store = SettingsStore::new(MemoryStorage::new());
        store.initialize().unwrap();
        store
    }

    fn reboot(store: SettingsStore<MemoryStorage>) -> SettingsStore<MemoryStorage> {
        let mut store = SettingsStore::new(store.into_storage());
        store.initialize().unwrap();
        store
    }

    #[test]
    fn first_boot_writes_defaults_and_marker() {
        let store = ready_store();

        assert!(store.is_ready());
        assert_eq!(store.settings(), &Settings::default());
        let keys = store.storage().keys(NAMESPACE);
        assert!(keys.contains(&keys::INITIALIZED.to_string()));
        assert!(keys.contains(&keys::LANGUAGE_CODE.to_string()));
        assert_eq!(keys.len(), 13);
    }

    #[test]
    fn initialize_fails_when_medium_unavailable() {
        let mut store = SettingsStore::new(MemoryStorage::unavailable());
        assert!(matches!(
            store.initialize(),
            Err(SettingsError::Storage(StorageError::Open(..)))
        ));
        assert!(!store.is_ready());
    }

    #[test]
    fn setters_fail_before_initialize() {
        let mut store = SettingsStore::new(MemoryStorage::new());

        assert!(matches!(
            store.set_target_temp(22.0),
            Err(SettingsError::NotInitialized)
        ));
        assert!(matches!(
            store.set_mode_str("bogus"),
            Err(SettingsError::NotInitialized)
        ));
        assert!(matches!(
            store.update_settings(&Settings::default()),
            Err(SettingsError::NotInitialized)
        ));
        assert_eq!(store.target_temp(), Settings::default().target_temp);
        store.reset().unwrap();
        assert!(store.storage().keys(NAMESPACE).is_empty());
    }

    #[test]
    fn target_is_clamped_into_range() {
        let mut store = ready_store();

        store.set_target_temp(80.0).unwrap();
        assert_eq!(store.target_temp(), 35.0);

        store.set_target_temp(-5.0).unwrap();
        assert_eq!(store.target_temp(), 10.0);

        store.set_eco_temp(60.0).unwrap();
        assert_eq!(store.eco_temp(), 35.0);
    }

    #[test]
    fn non_finite_input_is_rejected_without_mutation() {
        let mut store = ready_store();

        assert!(store.set_target_temp(f32::NAN).is_err());
        assert!(store.set_temp_offset(f32::INFINITY).is_err());
        assert_eq!(store.settings(), &Settings::default());
    }

    #[test]
    fn raising_min_pulls_setpoints_up() {
        let mut store = ready_store();
        store.set_target_temp(18.0).unwrap();

        store.set_min_temp(19.0).unwrap();

        assert_eq!(store.min_temp(), 19.0);
        assert_eq!(store.target_temp(), 19.0);
        assert_eq!(store.eco_temp(), 19.0);
    }

    #[test]
    fn lowering_max_pulls_setpoints_down() {
        let mut store = ready_store();
        store.set_target_temp(25.0).unwrap();

        store.set_max_temp(22.0).unwrap();

        assert_eq!(store.max_temp(), 22.0);
        assert_eq!(store.target_temp(), 22.0);
        assert_eq!(store.eco_temp(), 16.0);
    }

    #[test]
    fn min_and_max_never_cross() {
        let mut store = ready_store();

        store.set_min_temp(40.0).unwrap();
        assert_eq!(store.min_temp(), 34.5);

        store.set_max_temp(0.0).unwrap();
        assert_eq!(store.max_temp(), 35.0);

        store.set_max_temp(90.0).unwrap();
        assert_eq!(store.max_temp(), 50.0);

        store.set_min_temp(-10.0).unwrap();
        assert_eq!(store.min_temp(), 0.0);
        store.settings().validate().unwrap();
    }

    #[test]
    fn clamped_max_survives_restart() {
        let mut store = ready_store();
        store.set_min_temp(15.55).unwrap();
        store.set_max_temp(0.0).unwrap();
        store.settings().validate().unwrap();
        let before = store.settings().clone();

        let store = reboot(store);

        assert_eq!(store.settings(), &before);
        assert_eq!(store.min_temp(), 15.55);
    }

    #[test]
    fn bulk_update_normalizes_locale() {
        let mut store = ready_store();
        let candidate = Settings {
            timezone: "  Europe/London ".to_string(),
            language_code: "EN".to_string(),
            ..Settings::default()
        };

        store.update_settings(&candidate).unwrap();

        assert_eq!(store.timezone(), "Europe/London");
        assert_eq!(store.language_code(), "en");
    }

    #[test]
    fn hysteresis_is_clamped() {
        let mut store = ready_store();

        store.set_hysteresis(0.0).unwrap();
        assert_eq!(store.hysteresis(), 0.1);

        store.set_hysteresis(9.0).unwrap();
        assert_eq!(store.hysteresis(), 5.0);
    }

    #[test]
    fn mode_round_trips() {
        let mut store = ready_store();

        for mode in ["off", "eco", "on"] {
            store.set_mode_str(mode).unwrap();
            assert_eq!(store.mode().as_str(), mode);
        }
    }

    #[test]
    fn unknown_mode_is_fatal_and_leaves_mode_untouched() {
        let mut store = ready_store();
        store.set_mode(ThermostatMode::On).unwrap();

        let err = store.set_mode_str("heat").unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(store.mode(), ThermostatMode::On);
    }

    #[test]
    fn locale_setters_validate() {
        let mut store = ready_store();

        assert!(store.set_timezone("").is_err());
        assert!(store.set_language_code("nld").is_err());

        store.set_timezone("Europe/London").unwrap();
        store.set_language_code("EN").unwrap();
        assert_eq!(store.timezone(), "Europe/London");
        assert_eq!(store.language_code(), "en");
    }

    #[test]
    fn thresholds_reject_negative_values() {
        let mut store = ready_store();

        assert!(store.set_temp_change_threshold(-0.1).is_err());
        store.set_humidity_change_threshold(5.0).unwrap();
        assert_eq!(store.humidity_change_threshold(), 5.0);
    }

    #[test]
    fn bulk_update_is_all_or_nothing() {
        let mut store = ready_store();
        let candidate = Settings {
            target_temp: 22.0,
            mode: ThermostatMode::Eco,
            min_temp: 25.0,
            ..Settings::default()
        };

        assert!(store.update_settings(&candidate).is_err());
        assert_eq!(store.settings(), &Settings::default());

        let candidate = Settings {
            target_temp: 22.0,
            eco_temp: 17.5,
            mode: ThermostatMode::Eco,
            hysteresis: 0.3,
            ..Settings::default()
        };
        store.update_settings(&candidate).unwrap();
        assert_eq!(store.settings(), &candidate);
        assert_eq!(store.active_target_temp(), 17.5);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut store = ready_store();
        store.set_target_temp(23.0).unwrap();
        store.set_language_code("en").unwrap();

        store.reset().unwrap();
        let first = store.settings().clone();
        let first_keys = store.storage().keys(NAMESPACE);
        store.reset().unwrap();

        assert_eq!(first, Settings::default());
        assert_eq!(store.settings(), &first);
        assert_eq!(store.storage().keys(NAMESPACE), first_keys);
    }

    #[test]
    fn values_survive_restart_bit_for_bit() {
        let mut store = ready_store();
        store.set_min_temp(12.25).unwrap();
        store.set_target_temp(21.7).unwrap();
        store.set_eco_temp(15.3).unwrap();
        store.set_temp_offset(-0.37).unwrap();
        store.set_hysteresis(0.3).unwrap();
        store.set_mode(ThermostatMode::Eco).unwrap();
        store.set_epd_refresh_rate(90).unwrap();
        store.set_temp_change_threshold(0.7).unwrap();
        store.set_humidity_change_threshold(3.3).unwrap();
        store.set_timezone("America/New_York").unwrap();
        store.set_language_code("en").unwrap();
        let before = store.settings().clone();
        assert_ne!(before.temp_change_threshold, Settings::default().temp_change_threshold);
        assert_ne!(
            before.humidity_change_threshold,
            Settings::default().humidity_change_threshold
        );

        let store = reboot(store);

        assert_eq!(store.settings(), &before);
        for (after, expected) in [
            (store.target_temp(), before.target_temp),
            (store.eco_temp(), before.eco_temp),
            (store.temp_offset(), before.temp_offset),
            (store.hysteresis(), before.hysteresis),
            (store.min_temp(), before.min_temp),
            (store.max_temp(), before.max_temp),
            (store.temp_change_threshold(), before.temp_change_threshold),
            (store.humidity_change_threshold(), before.humidity_change_threshold),
        ] {
            assert_eq!(after.to_bits(), expected.to_bits());
        }
        assert_eq!(store.storage().get_bool(keys::INITIALIZED).unwrap(), Some(true));
        assert_eq!(
            store.storage().keys(NAMESPACE).len(),
            13,
            "marker and every field persisted"
        );
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let mut storage = MemoryStorage::new();
        storage.insert(NAMESPACE, keys::INITIALIZED, StoredValue::Bool(true));
        storage.insert(NAMESPACE, keys::TARGET_TEMP, StoredValue::F32(22.5));
        storage.insert(NAMESPACE, keys::TEMP_OFFSET, StoredValue::Str("x".into()));

        let mut store = SettingsStore::new(storage);
        store.initialize().unwrap();

        assert_eq!(store.target_temp(), 22.5);
        assert_eq!(store.temp_offset(), 0.0);
        assert_eq!(store.mode(), ThermostatMode::Off);
    }

    #[test]
    fn invalid_stored_record_resets_to_defaults() {
        let mut storage = MemoryStorage::new();
        storage.insert(NAMESPACE, keys::INITIALIZED, StoredValue::Bool(true));
        storage.insert(NAMESPACE, keys::MIN_TEMP, StoredValue::F32(30.0));
        storage.insert(NAMESPACE, keys::MAX_TEMP, StoredValue::F32(20.0));

        let mut store = SettingsStore::new(storage);
        store.initialize().unwrap();

        assert_eq!(store.settings(), &Settings::default());
        let store = reboot(store);
        assert_eq!(store.settings(), &Settings::default());
    }

    #[test]
    fn corrupt_stored_mode_resets_to_defaults() {
        let mut storage = MemoryStorage::new();
        storage.insert(NAMESPACE, keys::INITIALIZED, StoredValue::Bool(true));
        storage.insert(NAMESPACE, keys::MODE, StoredValue::Str("turbo".into()));
        storage.insert(NAMESPACE, keys::TARGET_TEMP, StoredValue::F32(24.0));

        let mut store = SettingsStore::new(storage);
        store.initialize().unwrap();

        assert_eq!(store.mode(), ThermostatMode::Off);
        assert_eq!(store.target_temp(), Settings::default().target_temp);
    }

    #[test]
    fn setter_persists_only_touched_keys() {
        let mut store = ready_store();
        let mut storage = store.into_storage();
        storage.open(NAMESPACE).unwrap();
        storage.remove(keys::ECO_TEMP).unwrap();
        let mut store = SettingsStore::new(storage);
        store.initialize().unwrap();

        store.set_target_temp(21.0).unwrap();

        assert!(!store.storage().contains(keys::ECO_TEMP).unwrap());
        assert_eq!(
            store.storage().get_f32(keys::TARGET_TEMP).unwrap(),
            Some(21.0)
        );
    }

    proptest! {
        #[test]
        fn target_always_equals_clamped_input(t in -100.0f32..100.0) {
            let mut store = ready_store();
            store.set_target_temp(t).unwrap();
            prop_assert_eq!(store.target_temp(), t.clamp(store.min_temp(), store.max_temp()));
        }

        #[test]
        fn ordering_holds_after_any_bound_change(
            min in -20.0f32..70.0,
            max in -20.0f32..70.0,
            target in -20.0f32..70.0,
        ) {
            let mut store = ready_store();
            store.set_target_temp(target).unwrap();
            store.set_min_temp(min).unwrap();
            store.set_max_temp(max).unwrap();

            let settings = store.settings();
            prop_assert!(settings.min_temp < settings.max_temp);
            prop_assert!(settings.min_temp <= settings.target_temp);
            prop_assert!(settings.target_temp <= settings.max_temp);
            prop_assert!(settings.min_temp <= settings.eco_temp);
            prop_assert!(settings.eco_temp <= settings.max_temp);
            prop_assert!(settings.validate().is_ok());
        }

        #[test]
        fn clamped_bounds_reload_unchanged(min in 0.0f32..50.0) {
            let mut store = ready_store();
            store.set_min_temp(min).unwrap();
            store.set_max_temp(0.0).unwrap();
            let before = store.settings().clone();

            let store = reboot(store);

            prop_assert_eq!(store.settings(), &before);
        }
    }
}
