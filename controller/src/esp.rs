use core::convert::TryInto;
use std::{
    sync::{mpsc, Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use dht_sensor::dht22;
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, IOPin, Input, InputOutput, Output, OutputPin, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::Value;

use thermostat_common::{
    api, handle_button,
    settings::keys,
    topics::{AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE},
    ApiError, ButtonEvent, ClimateSensor, ClimateSnapshot, DisplayPolicy, ErrorBody,
    HeaterError, HeaterOutput, MqttBridge, SensorError, SensorReading, SettingField,
    SettingsError, SettingsStorage, SettingsStore, StorageError, Thermostat, ThermostatConfig,
    ThermostatStatus, Topics,
};

type Store = SettingsStore<NvsStorage>;
type SharedStore = Arc<Mutex<Store>>;
type SharedStatus = Arc<Mutex<ThermostatStatus>>;

const MAX_HTTP_BODY: usize = 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const MAX_NVS_STR_LEN: usize = 64;
/// NVS rejects keys longer than this.
const NVS_KEY_MAX_LEN: usize = 15;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const LOOP_INTERVAL_MS: u64 = 20;
const SENSOR_RETRY_MAX_MS: u64 = 30_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

const BUTTON_DEBOUNCE_MS: u64 = 30;
const BUTTON_LONG_PRESS_MS: u64 = 1_000;
const BUTTON_MULTI_CLICK_MS: u64 = 400;

/// Locks shared state, recovering it if a handler panicked while holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Settings storage in the default NVS partition. Floats are kept as their
/// IEEE-754 bits and booleans as `u8`.
struct NvsStorage {
    partition: EspDefaultNvsPartition,
    nvs: Option<EspNvs<NvsDefault>>,
}

impl NvsStorage {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            nvs: None,
        }
    }

    fn nvs(&self) -> Result<&EspNvs<NvsDefault>, StorageError> {
        self.nvs.as_ref().ok_or(StorageError::NotOpen)
    }

    fn nvs_mut(&mut self) -> Result<&mut EspNvs<NvsDefault>, StorageError> {
        self.nvs.as_mut().ok_or(StorageError::NotOpen)
    }
}

fn nvs_key(key: &str) -> Result<&str, StorageError> {
    let short = match key {
        keys::TEMP_CHANGE_THRESHOLD => "tempChangeThr",
        keys::HUMIDITY_CHANGE_THRESHOLD => "humChangeThr",
        other => other,
    };
    if short.len() > NVS_KEY_MAX_LEN {
        return Err(StorageError::Backend(format!("key `{key}` is too long for NVS")));
    }
    Ok(short)
}

fn backend(err: esp_idf_svc::sys::EspError) -> StorageError {
    StorageError::Backend(err.to_string())
}

impl SettingsStorage for NvsStorage {
    fn open(&mut self, namespace: &str) -> Result<(), StorageError> {
        let nvs = EspNvs::new(self.partition.clone(), namespace, true)
            .map_err(|err| StorageError::Open(namespace.to_string(), err.to_string()))?;
        self.nvs = Some(nvs);
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, StorageError> {
        self.nvs()?.contains(nvs_key(key)?).map_err(backend)
    }

    fn get_f32(&self, key: &str) -> Result<Option<f32>, StorageError> {
        let bits = self.nvs()?.get_u32(nvs_key(key)?).map_err(backend)?;
        Ok(bits.map(f32::from_bits))
    }

    fn set_f32(&mut self, key: &str, value: f32) -> Result<(), StorageError> {
        self.nvs_mut()?
            .set_u32(nvs_key(key)?, value.to_bits())
            .map_err(backend)
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StorageError> {
        self.nvs()?.get_u32(nvs_key(key)?).map_err(backend)
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError> {
        self.nvs_mut()?.set_u32(nvs_key(key)?, value).map_err(backend)
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut buffer = [0_u8; MAX_NVS_STR_LEN];
        let value = self
            .nvs()?
            .get_str(nvs_key(key)?, &mut buffer)
            .map_err(backend)?;
        Ok(value.map(str::to_string))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        if value.len() >= MAX_NVS_STR_LEN {
            return Err(StorageError::Backend(format!(
                "value for `{key}` exceeds {} bytes",
                MAX_NVS_STR_LEN - 1
            )));
        }
        self.nvs_mut()?.set_str(nvs_key(key)?, value).map_err(backend)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StorageError> {
        let value = self.nvs()?.get_u8(nvs_key(key)?).map_err(backend)?;
        Ok(value.map(|raw| raw != 0))
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StorageError> {
        self.nvs_mut()?
            .set_u8(nvs_key(key)?, u8::from(value))
            .map_err(backend)
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.nvs_mut()?.remove(nvs_key(key)?).map_err(backend)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        for key in keys::ALL {
            self.remove(key)?;
        }
        Ok(())
    }
}

struct Dht22Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl Dht22Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl ClimateSensor for Dht22Sensor {
    fn begin(&mut self) -> Result<(), SensorError> {
        // The sensor needs a second after power-up before it answers.
        thread::sleep(Duration::from_secs(1));
        self.read()
            .map(|_| ())
            .map_err(|err| SensorError::Init(err.to_string()))
    }

    fn read(&mut self) -> Result<SensorReading, SensorError> {
        self.pin
            .set_high()
            .map_err(|err| SensorError::Read(err.to_string()))?;
        let reading = dht22::blocking::read(&mut self.delay, &mut self.pin)
            .map_err(|err| SensorError::Read(format!("{err:?}")))?;
        Ok(SensorReading {
            temperature: reading.temperature,
            humidity: reading.relative_humidity,
        })
    }
}

struct RelayHeater {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl RelayHeater {
    fn new(pin: AnyOutputPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::output(pin)?;
        pin.set_low()?;
        Ok(Self { pin })
    }
}

impl HeaterOutput for RelayHeater {
    fn set_energized(&mut self, on: bool) -> Result<(), HeaterError> {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        result.map_err(|err| HeaterError(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gesture {
    Clicks(u8),
    LongPress,
}

#[derive(Debug, Clone, Copy)]
enum ButtonRole {
    Mode,
    TempUp,
    TempDown,
}

impl ButtonRole {
    fn event(self, gesture: Gesture) -> Option<ButtonEvent> {
        match (self, gesture) {
            (Self::Mode, Gesture::Clicks(_)) => Some(ButtonEvent::ModeClick),
            (Self::Mode, Gesture::LongPress) => Some(ButtonEvent::ModeLongPress),
            (Self::TempUp, Gesture::Clicks(clicks)) => Some(ButtonEvent::TempUp { clicks }),
            (Self::TempDown, Gesture::Clicks(clicks)) => Some(ButtonEvent::TempDown { clicks }),
            (Self::TempUp | Self::TempDown, Gesture::LongPress) => None,
        }
    }
}

/// Active-low push button with click counting and long-press detection.
struct ButtonInput {
    role: ButtonRole,
    pin: PinDriver<'static, AnyIOPin, Input>,
    pressed_since: Option<u64>,
    long_fired: bool,
    clicks: u8,
    last_release_ms: u64,
}

impl ButtonInput {
    fn new(role: ButtonRole, pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input(pin)?;
        pin.set_pull(Pull::Up)?;
        Ok(Self {
            role,
            pin,
            pressed_since: None,
            long_fired: false,
            clicks: 0,
            last_release_ms: 0,
        })
    }

    fn poll(&mut self, now_ms: u64) -> Option<ButtonEvent> {
        let pressed = self.pin.is_low();
        match (pressed, self.pressed_since) {
            (true, None) => self.pressed_since = Some(now_ms),
            (true, Some(since)) => {
                if !self.long_fired && now_ms.saturating_sub(since) >= BUTTON_LONG_PRESS_MS {
                    self.long_fired = true;
                    self.clicks = 0;
                    return self.role.event(Gesture::LongPress);
                }
            }
            (false, Some(since)) => {
                self.pressed_since = None;
                if !self.long_fired && now_ms.saturating_sub(since) >= BUTTON_DEBOUNCE_MS {
                    self.clicks = self.clicks.saturating_add(1);
                    self.last_release_ms = now_ms;
                }
                self.long_fired = false;
            }
            (false, None) => {}
        }

        if self.clicks > 0
            && self.pressed_since.is_none()
            && now_ms.saturating_sub(self.last_release_ms) >= BUTTON_MULTI_CLICK_MS
        {
            let clicks = std::mem::take(&mut self.clicks);
            return self.role.event(Gesture::Clicks(clicks));
        }
        None
    }
}

enum MqttEvent {
    Connected,
    Disconnected,
    Message { topic: String, data: Vec<u8> },
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let mut store = SettingsStore::new(NvsStorage::new(nvs_partition.clone()));
    if let Err(err) = store.initialize() {
        restart_device(&format!("settings storage unavailable: {err}"));
    }
    let store: SharedStore = Arc::new(Mutex::new(store));

    let config = ThermostatConfig::default();
    let heater = RelayHeater::new(pins.gpio25.downgrade_output())
        .context("failed to initialize heater output")?;
    let sensor =
        Dht22Sensor::new(pins.gpio21.downgrade()).context("failed to initialize DHT22 pin")?;
    let mut thermostat = Thermostat::new(config.clone(), sensor, heater);
    begin_with_backoff(&mut thermostat);

    let mut buttons = [
        ButtonInput::new(ButtonRole::Mode, pins.gpio27.downgrade())?,
        ButtonInput::new(ButtonRole::TempUp, pins.gpio13.downgrade())?,
        ButtonInput::new(ButtonRole::TempDown, pins.gpio14.downgrade())?,
    ];

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition) {
        Ok(wifi) => Some(wifi),
        Err(err) => {
            warn!("wifi unavailable, running standalone: {err:#}");
            None
        }
    };
    let _sntp = match EspSntp::new_default() {
        Ok(sntp) => Some(sntp),
        Err(err) => {
            warn!("failed to start SNTP: {err}");
            None
        }
    };

    let status: SharedStatus = Arc::new(Mutex::new(thermostat.status()));
    let server = create_http_server(store.clone(), status.clone())?;

    let topics = Topics::default();
    let (mut mqtt, conn) = create_mqtt_client(&topics)?;
    let (events_tx, events_rx) = mpsc::channel();
    spawn_mqtt_receiver(conn, events_tx);
    let mut bridge = MqttBridge::new(topics, &config);
    let mut mqtt_connected = false;
    let mut display = DisplayPolicy::new();

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        for button in &mut buttons {
            if let Some(event) = button.poll(now_ms) {
                if let Err(err) = handle_button(&mut *lock(&store), event) {
                    handle_settings_error("button", &err);
                }
            }
        }

        for event in events_rx.try_iter() {
            match event {
                MqttEvent::Connected => {
                    mqtt_connected = true;
                    let settings = lock(&store).settings().clone();
                    if let Err(err) = announce(&mut mqtt, &mut bridge, &settings) {
                        warn!("mqtt announce failed: {err:#}");
                    }
                }
                MqttEvent::Disconnected => mqtt_connected = false,
                MqttEvent::Message { topic, data } => {
                    let result = bridge.handle_message(&mut *lock(&store), &topic, &data);
                    if let Err(err) = result {
                        handle_settings_error("mqtt", &err);
                    }
                }
            }
        }

        let settings = lock(&store).settings().clone();
        thermostat.update(now_ms, &settings);
        let current = thermostat.status();
        *lock(&status) = current;

        let snapshot = ClimateSnapshot::capture(&settings, &current);
        if let Some(frame) = display.update(now_ms, &snapshot, &settings, Utc::now()) {
            info!(
                "display: {} | target {} | {} | heating={} | {}",
                frame.current_text(),
                frame.target_text().unwrap_or_else(|| "-".to_string()),
                frame.humidity_text(),
                frame.heating,
                frame.date,
            );
        }

        if mqtt_connected {
            if let Some(ha_state) = bridge.poll(now_ms, snapshot) {
                if let Err(err) = publish_json(&mut mqtt, &bridge.topics().state, &ha_state) {
                    warn!("state publish failed: {err:#}");
                }
            }
        }

        thread::sleep(Duration::from_millis(LOOP_INTERVAL_MS));
    }
}

fn begin_with_backoff(thermostat: &mut Thermostat<Dht22Sensor, RelayHeater>) {
    let mut delay_ms = 500;
    loop {
        match thermostat.begin() {
            Ok(()) => return,
            Err(err) => {
                warn!("sensor init failed, retrying in {delay_ms}ms: {err}");
                thread::sleep(Duration::from_millis(delay_ms));
                delay_ms = (delay_ms * 2).min(SENSOR_RETRY_MAX_MS);
            }
        }
    }
}

fn handle_settings_error(source: &str, err: &SettingsError) {
    if err.is_fatal() {
        restart_device(&format!("fatal settings error from {source}: {err}"));
    } else {
        warn!("{source} command failed: {err}");
    }
}

fn restart_device(reason: &str) {
    error!("{reason}; restarting");
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() };
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
) -> anyhow::Result<EspWifi<'static>> {
    let ssid = option_env!("WIFI_SSID").unwrap_or_default();
    let pass = option_env!("WIFI_PASS").unwrap_or_default();
    if ssid.is_empty() {
        return Err(anyhow!("no wifi credentials compiled in"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: pass
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }
        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!("all wifi connect attempts failed: {err:#}")),
    }
}

fn create_http_server(store: SharedStore, status: SharedStatus) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    {
        let store = store.clone();
        let status = status.clone();
        server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
            write_json(req, &build_status(&store, &status))
        })?;
    }

    {
        let store = store.clone();
        let status = status.clone();
        server.fn_handler::<anyhow::Error, _>("/api/temperature", Method::Get, move |req| {
            let store = lock(&store);
            let temp = lock(&status).current_temp + store.temp_offset();
            write_result(req, api::reading(&*store, "currentTemp", temp))
        })?;
    }

    {
        let store = store.clone();
        let status = status.clone();
        server.fn_handler::<anyhow::Error, _>("/api/humidity", Method::Get, move |req| {
            let store = lock(&store);
            let humidity = lock(&status).current_humidity;
            write_result(req, api::reading(&*store, "currentHumidity", humidity))
        })?;
    }

    let fields = [
        ("/api/target", "/api/target/set", SettingField::TargetTemp),
        ("/api/eco-temp", "/api/eco-temp/set", SettingField::EcoTemp),
        ("/api/mode", "/api/mode/set", SettingField::Mode),
        ("/api/temperature/max", "/api/temperature/max/set", SettingField::MaxTemp),
        ("/api/temperature/min", "/api/temperature/min/set", SettingField::MinTemp),
    ];
    for (get_uri, set_uri, field) in fields {
        {
            let store = store.clone();
            server.fn_handler::<anyhow::Error, _>(get_uri, Method::Get, move |req| {
                write_result(req, api::read_setting(&*lock(&store), field))
            })?;
        }

        let store = store.clone();
        let status = status.clone();
        server.fn_handler::<anyhow::Error, _>(set_uri, Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let result = api::write_setting(&mut *lock(&store), field, &body);
            match result {
                Ok(()) => write_json(req, &build_status(&store, &status)),
                Err(err) => write_error(req, &err),
            }
        })?;
    }

    {
        let store = store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/settings", Method::Get, move |req| {
            write_result(req, api::settings_body(&*lock(&store)))
        })?;
    }

    {
        let store = store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/settings", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let mut store = lock(&store);
            let result =
                api::merge_settings(&mut *store, &body).and_then(|()| api::settings_body(&*store));
            write_result(req, result)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/reset", Method::Post, move |req| {
        let result = lock(&store).reset();
        match result {
            Ok(()) => write_json(req, &build_status(&store, &status)),
            Err(err) => write_error(req, &ApiError::from(err)),
        }
    })?;

    Ok(server)
}

fn build_status(store: &SharedStore, status: &SharedStatus) -> thermostat_common::StatusPayload {
    let store = lock(store);
    let current = *lock(status);
    api::status_payload(&*store, &current, monotonic_ms() / 1_000)
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_result(
    req: Request<&mut EspHttpConnection<'_>>,
    result: Result<Value, ApiError>,
) -> anyhow::Result<()> {
    match result {
        Ok(body) => write_json(req, &body),
        Err(err) => write_error(req, &err),
    }
}

fn write_json<T: Serialize>(
    req: Request<&mut EspHttpConnection<'_>>,
    payload: &T,
) -> anyhow::Result<()> {
    write_body(req, 200, &serde_json::to_vec(payload)?)
}

fn write_error(req: Request<&mut EspHttpConnection<'_>>, err: &ApiError) -> anyhow::Result<()> {
    if err.is_fatal() {
        restart_device(&format!("fatal settings error from http: {err}"));
    }
    if let ApiError::Internal(_) | ApiError::Settings(SettingsError::Storage(_)) = err {
        warn!("settings request failed: {err}");
    }
    write_body(req, err.status_code(), &serde_json::to_vec(&ErrorBody::from(err))?)
}

fn write_body(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    body: &[u8],
) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(body)?;
    Ok(())
}

fn create_mqtt_client(topics: &Topics) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let host = option_env!("MQTT_HOST").unwrap_or("localhost");
    let port = option_env!("MQTT_PORT")
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let user = option_env!("MQTT_USER").unwrap_or_default();
    let pass = option_env!("MQTT_PASS").unwrap_or_default();
    let url = format!("mqtt://{host}:{port}");

    let conf = MqttClientConfiguration {
        client_id: Some(topics.device_id.as_str()),
        username: (!user.is_empty()).then_some(user),
        password: (!pass.is_empty()).then_some(pass),
        keep_alive_interval: Some(Duration::from_secs(60)),
        lwt: Some(LwtConfiguration {
            topic: topics.availability.as_str(),
            payload: AVAILABILITY_OFFLINE.as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(mut conn: EspMqttConnection, events: mpsc::Sender<MqttEvent>) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            let event = match conn.next() {
                Ok(event) => event,
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    continue;
                }
            };

            let forwarded = match event.payload() {
                EventPayload::Connected(_) => Some(MqttEvent::Connected),
                EventPayload::Disconnected => Some(MqttEvent::Disconnected),
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details: Details::Complete,
                    ..
                } => {
                    if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {topic} ({} bytes)",
                            data.len()
                        );
                        None
                    } else {
                        Some(MqttEvent::Message {
                            topic: topic.to_string(),
                            data: data.to_vec(),
                        })
                    }
                }
                _ => None,
            };

            if let Some(event) = forwarded {
                if events.send(event).is_err() {
                    return;
                }
            }
        });
    if let Err(err) = spawned {
        error!("failed to spawn mqtt receiver thread: {err}");
    }
}

/// Subscribes to commands and publishes availability plus discovery.
fn announce(
    mqtt: &mut EspMqttClient<'static>,
    bridge: &mut MqttBridge,
    settings: &thermostat_common::Settings,
) -> anyhow::Result<()> {
    bridge.on_connected();
    let topics = bridge.topics().clone();

    mqtt.subscribe(&topics.command_filter(), QoS::AtLeastOnce)?;
    mqtt.publish(
        &topics.availability,
        QoS::AtLeastOnce,
        true,
        AVAILABILITY_ONLINE.as_bytes(),
    )?;
    publish_json(mqtt, &topics.climate_discovery(), &bridge.climate_discovery(settings))?;
    for (topic, payload) in bridge.sensor_discovery() {
        publish_json(mqtt, &topic, &payload)?;
    }
    info!("mqtt connected, discovery published");
    Ok(())
}

fn publish_json<T: Serialize>(
    mqtt: &mut EspMqttClient<'static>,
    topic: &str,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    mqtt.publish(topic, QoS::AtLeastOnce, true, &body)?;
    Ok(())
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
