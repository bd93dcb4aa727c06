use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{Mutex, RwLock},
};
use tracing::{error, info, warn};

use thermostat_common::{
    api,
    topics::{AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE},
    ApiError, ClimateSnapshot, DisplayPolicy, ErrorBody, FileStorage, MqttBridge, SettingField,
    Settings, SettingsError, SettingsStorage, SettingsStore, StatusPayload, Thermostat,
    ThermostatConfig, Topics,
};

use crate::sim::{LoggingHeater, SimulatedRoom};

type Store = SettingsStore<Box<dyn SettingsStorage + Send + Sync>>;
type HostThermostat = Thermostat<SimulatedRoom, LoggingHeater>;

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const SENSOR_RETRY_MAX_MS: u64 = 30_000;

/// Lock order: `settings` before `thermostat`.
#[derive(Clone)]
struct AppState {
    settings: Arc<RwLock<Store>>,
    thermostat: Arc<Mutex<HostThermostat>>,
}

#[derive(Clone)]
struct MqttState {
    client: AsyncClient,
    bridge: Arc<Mutex<MqttBridge>>,
    connected: Arc<AtomicBool>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ThermostatConfig::default();
    let data_dir = std::env::var("THERMOSTAT_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.thermostat"));

    let storage: Box<dyn SettingsStorage + Send + Sync> = Box::new(FileStorage::new(&data_dir));
    let mut store = SettingsStore::new(storage);
    store
        .initialize()
        .with_context(|| format!("failed to open settings in {}", data_dir.display()))?;

    let heater = LoggingHeater::new();
    let room = SimulatedRoom::new(heater.energized_flag(), 18.0);
    let mut thermostat = Thermostat::new(config.clone(), room, heater);
    begin_with_backoff(&mut thermostat).await;

    let state = AppState {
        settings: Arc::new(RwLock::new(store)),
        thermostat: Arc::new(Mutex::new(thermostat)),
    };

    let topics = Topics::default();
    let (client, eventloop) = AsyncClient::new(mqtt_options(&topics), 64);
    let mqtt = MqttState {
        client,
        bridge: Arc::new(Mutex::new(MqttBridge::new(topics, &config))),
        connected: Arc::new(AtomicBool::new(false)),
    };

    spawn_control_loop(state.clone(), config.control_interval_ms);
    spawn_display_loop(state.clone());
    spawn_mqtt_loop(state.clone(), mqtt.clone(), eventloop);
    spawn_mqtt_publish_loop(state.clone(), mqtt);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/temperature", get(handle_get_temperature))
        .route("/api/humidity", get(handle_get_humidity))
        .route("/api/target", get(handle_get_target))
        .route("/api/target/set", post(handle_set_target))
        .route("/api/eco-temp", get(handle_get_eco_temp))
        .route("/api/eco-temp/set", post(handle_set_eco_temp))
        .route("/api/mode", get(handle_get_mode))
        .route("/api/mode/set", post(handle_set_mode))
        .route("/api/temperature/max", get(handle_get_max_temp))
        .route("/api/temperature/max/set", post(handle_set_max_temp))
        .route("/api/temperature/min", get(handle_get_min_temp))
        .route("/api/temperature/min/set", post(handle_set_min_temp))
        .route(
            "/api/settings",
            get(handle_get_settings).put(handle_put_settings),
        )
        .route("/api/reset", post(handle_reset))
        .with_state(state)
}

async fn begin_with_backoff(thermostat: &mut HostThermostat) {
    let mut delay_ms = 500;
    loop {
        match thermostat.begin() {
            Ok(()) => return,
            Err(err) => {
                warn!("sensor init failed, retrying in {delay_ms}ms: {err}");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SENSOR_RETRY_MAX_MS);
            }
        }
    }
}

fn mqtt_options(topics: &Topics) -> MqttOptions {
    let host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut options = MqttOptions::new(format!("{}-controller", topics.device_id), host, port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_last_will(LastWill::new(
        &topics.availability,
        AVAILABILITY_OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));

    let user = std::env::var("MQTT_USER").unwrap_or_default();
    let pass = std::env::var("MQTT_PASS").unwrap_or_default();
    if !user.is_empty() {
        options.set_credentials(user, pass);
    }
    options
}

fn spawn_control_loop(state: AppState, interval_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;
            let settings = state.settings.read().await.settings().clone();
            state
                .thermostat
                .lock()
                .await
                .update(monotonic_ms(), &settings);
        }
    });
}

fn spawn_display_loop(state: AppState) {
    tokio::spawn(async move {
        let mut policy = DisplayPolicy::new();
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let (settings, snapshot) = snapshot(&state).await;
            if let Some(frame) = policy.update(monotonic_ms(), &snapshot, &settings, Utc::now()) {
                info!(
                    "display: {} | target {} | {} | heating={} | {}",
                    frame.current_text(),
                    frame.target_text().unwrap_or_else(|| "-".to_string()),
                    frame.humidity_text(),
                    frame.heating,
                    frame.date,
                );
            }
        }
    });
}

fn spawn_mqtt_loop(state: AppState, mqtt: MqttState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.payload.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            message.topic,
                            message.payload.len()
                        );
                        continue;
                    }
                    let mut store = state.settings.write().await;
                    let result = mqtt.bridge.lock().await.handle_message(
                        &mut *store,
                        &message.topic,
                        &message.payload,
                    );
                    match result {
                        Err(err) if err.is_fatal() => exit_fatal(&err),
                        Err(err) => warn!("mqtt command failed: {err}"),
                        Ok(()) => {}
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    mqtt.connected.store(true, Ordering::Relaxed);
                    tokio::spawn(announce(state.clone(), mqtt.clone()));
                }
                Ok(_) => {}
                Err(err) => {
                    mqtt.connected.store(false, Ordering::Relaxed);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });
}

/// Subscribes to commands and publishes availability plus discovery.
async fn announce(state: AppState, mqtt: MqttState) {
    let settings = state.settings.read().await.settings().clone();
    let (topics, climate, sensors) = {
        let mut bridge = mqtt.bridge.lock().await;
        bridge.on_connected();
        (
            bridge.topics().clone(),
            bridge.climate_discovery(&settings),
            bridge.sensor_discovery(),
        )
    };

    let result = async {
        mqtt.client
            .subscribe(topics.command_filter(), QoS::AtLeastOnce)
            .await?;
        mqtt.client
            .publish(&topics.availability, QoS::AtLeastOnce, true, AVAILABILITY_ONLINE)
            .await?;
        mqtt.client
            .publish(
                topics.climate_discovery(),
                QoS::AtLeastOnce,
                true,
                climate.to_string(),
            )
            .await?;
        for (topic, payload) in sensors {
            mqtt.client
                .publish(topic, QoS::AtLeastOnce, true, payload.to_string())
                .await?;
        }
        Ok::<_, rumqttc::ClientError>(())
    }
    .await;

    match result {
        Ok(()) => info!("home assistant discovery published"),
        Err(err) => warn!("mqtt announce failed: {err}"),
    }
}

fn spawn_mqtt_publish_loop(state: AppState, mqtt: MqttState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(250));
        loop {
            interval.tick().await;
            if !mqtt.connected.load(Ordering::Relaxed) {
                continue;
            }

            let (_, snapshot) = snapshot(&state).await;
            let (topic, ha_state) = {
                let mut bridge = mqtt.bridge.lock().await;
                let topic = bridge.topics().state.clone();
                (topic, bridge.poll(monotonic_ms(), snapshot))
            };
            let Some(ha_state) = ha_state else {
                continue;
            };

            match serde_json::to_vec(&ha_state) {
                Ok(body) => {
                    if let Err(err) = mqtt
                        .client
                        .publish(topic, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("state publish failed: {err}");
                    }
                }
                Err(err) => warn!("state serialization failed: {err}"),
            }
        }
    });
}

async fn snapshot(state: &AppState) -> (Settings, ClimateSnapshot) {
    let settings = state.settings.read().await.settings().clone();
    let status = state.thermostat.lock().await.status();
    let snapshot = ClimateSnapshot::capture(&settings, &status);
    (settings, snapshot)
}

async fn build_status(state: &AppState) -> StatusPayload {
    let store = state.settings.read().await;
    let status = state.thermostat.lock().await.status();
    api::status_payload(&*store, &status, monotonic_ms() / 1_000)
}

async fn handle_get_status(State(state): State<AppState>) -> Response {
    Json(build_status(&state).await).into_response()
}

async fn handle_get_temperature(State(state): State<AppState>) -> Response {
    let store = state.settings.read().await;
    let temp = state.thermostat.lock().await.current_temp(store.temp_offset());
    json_result(api::reading(&*store, "currentTemp", temp))
}

async fn handle_get_humidity(State(state): State<AppState>) -> Response {
    let store = state.settings.read().await;
    let humidity = state.thermostat.lock().await.current_humidity();
    json_result(api::reading(&*store, "currentHumidity", humidity))
}

async fn handle_get_target(State(state): State<AppState>) -> Response {
    get_setting(&state, SettingField::TargetTemp).await
}

async fn handle_get_eco_temp(State(state): State<AppState>) -> Response {
    get_setting(&state, SettingField::EcoTemp).await
}

async fn handle_get_mode(State(state): State<AppState>) -> Response {
    get_setting(&state, SettingField::Mode).await
}

async fn handle_get_max_temp(State(state): State<AppState>) -> Response {
    get_setting(&state, SettingField::MaxTemp).await
}

async fn handle_get_min_temp(State(state): State<AppState>) -> Response {
    get_setting(&state, SettingField::MinTemp).await
}

async fn handle_set_target(State(state): State<AppState>, body: Bytes) -> Response {
    set_setting(&state, SettingField::TargetTemp, &body).await
}

async fn handle_set_eco_temp(State(state): State<AppState>, body: Bytes) -> Response {
    set_setting(&state, SettingField::EcoTemp, &body).await
}

async fn handle_set_mode(State(state): State<AppState>, body: Bytes) -> Response {
    set_setting(&state, SettingField::Mode, &body).await
}

async fn handle_set_max_temp(State(state): State<AppState>, body: Bytes) -> Response {
    set_setting(&state, SettingField::MaxTemp, &body).await
}

async fn handle_set_min_temp(State(state): State<AppState>, body: Bytes) -> Response {
    set_setting(&state, SettingField::MinTemp, &body).await
}

async fn handle_get_settings(State(state): State<AppState>) -> Response {
    json_result(api::settings_body(&*state.settings.read().await))
}

async fn handle_put_settings(State(state): State<AppState>, body: Bytes) -> Response {
    let mut store = state.settings.write().await;
    let result = api::merge_settings(&mut *store, &body).and_then(|()| api::settings_body(&*store));
    json_result(result)
}

async fn handle_reset(State(state): State<AppState>) -> Response {
    let result = state.settings.write().await.reset();
    match result {
        Ok(()) => handle_get_status(State(state)).await,
        Err(err) => error_response(&ApiError::from(err)),
    }
}

async fn get_setting(state: &AppState, field: SettingField) -> Response {
    json_result(api::read_setting(&*state.settings.read().await, field))
}

async fn set_setting(state: &AppState, field: SettingField, body: &[u8]) -> Response {
    let result = api::write_setting(&mut *state.settings.write().await, field, body);
    match result {
        Ok(()) => Json(build_status(state).await).into_response(),
        Err(err) => error_response(&err),
    }
}

fn json_result(result: Result<Value, ApiError>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &ApiError) -> Response {
    if err.is_fatal() {
        exit_fatal(err);
    }
    if let ApiError::Internal(_) | ApiError::Settings(SettingsError::Storage(_)) = err {
        warn!("settings request failed: {err}");
    }
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorBody::from(err))).into_response()
}

/// Invalid modes never come from the typed API/MQTT paths; one reaching the
/// store means state is corrupt, so the process exits and the supervisor
/// restarts it.
fn exit_fatal(err: &dyn std::fmt::Display) -> ! {
    error!("fatal settings error: {err}; exiting");
    std::process::exit(1);
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
