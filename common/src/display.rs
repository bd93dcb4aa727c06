//! E-paper refresh policy and frame content. The panel is slow and wears with
//! every full refresh, so the frame is only rebuilt when something visible
//! changed enough.

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::{
    config::Settings,
    types::{ClimateSnapshot, ThermostatMode},
};

pub struct LanguagePack {
    pub days: [&'static str; 7],
    pub months: [&'static str; 12],
}

pub const EN: LanguagePack = LanguagePack {
    days: ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"],
    months: [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ],
};

pub const NL: LanguagePack = LanguagePack {
    days: ["Zo", "Ma", "Di", "Wo", "Do", "Vr", "Za"],
    months: [
        "jan", "feb", "mrt", "apr", "mei", "jun", "jul", "aug", "sep", "okt", "nov", "dec",
    ],
};

/// Unknown codes fall back to Dutch.
pub fn language_pack(code: &str) -> &'static LanguagePack {
    if code.eq_ignore_ascii_case("en") {
        &EN
    } else {
        &NL
    }
}

pub fn resolve_timezone(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        warn!("unknown timezone `{name}`, showing UTC");
        Tz::UTC
    })
}

/// e.g. `Ma 6 jan 14:05`.
pub fn format_date(now: DateTime<Utc>, settings: &Settings) -> String {
    let pack = language_pack(&settings.language_code);
    let local = now.with_timezone(&resolve_timezone(&settings.timezone));
    format!(
        "{} {} {} {:02}:{:02}",
        pack.days[local.weekday().num_days_from_sunday() as usize],
        local.day(),
        pack.months[local.month0() as usize],
        local.hour(),
        local.minute(),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFrame {
    /// Rounded to the nearest 0.5.
    pub current_temp: f32,
    /// Hidden while the thermostat is off.
    pub target_temp: Option<f32>,
    /// Whole percent.
    pub humidity: f32,
    pub heating: bool,
    pub date: String,
}

impl DisplayFrame {
    pub fn current_text(&self) -> String {
        format!("{:.1}", self.current_temp)
    }

    pub fn target_text(&self) -> Option<String> {
        self.target_temp.map(|temp| format!("{temp:.1}"))
    }

    pub fn humidity_text(&self) -> String {
        format!("{:.0}%", self.humidity)
    }
}

#[derive(Debug, Default)]
pub struct DisplayPolicy {
    last_refresh_ms: Option<u64>,
    last_target: Option<f32>,
    last_current: Option<f32>,
    last_humidity: Option<f32>,
    last_heating: bool,
}

impl DisplayPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a frame to draw when a refresh is warranted: immediately when
    /// the heating flag or setpoint changed, otherwise once the refresh
    /// interval has passed and a reading moved past its threshold.
    pub fn update(
        &mut self,
        now_ms: u64,
        snapshot: &ClimateSnapshot,
        settings: &Settings,
        wall_clock: DateTime<Utc>,
    ) -> Option<DisplayFrame> {
        let current = (snapshot.current_temp * 2.0).round() / 2.0;
        let humidity = snapshot.humidity.round();
        let target = snapshot.target_temp;

        let urgent =
            snapshot.heating != self.last_heating || self.last_target != Some(target);

        let interval_ms = u64::from(settings.epd_refresh_rate) * 1_000;
        let interval_passed = self
            .last_refresh_ms
            .map(|last| now_ms.saturating_sub(last) >= interval_ms)
            .unwrap_or(true);
        let moved = |last: Option<f32>, value: f32, threshold: f32| {
            last.map(|last| (value - last).abs() >= threshold)
                .unwrap_or(true)
        };
        let drifted = moved(self.last_current, current, settings.temp_change_threshold)
            || moved(self.last_humidity, humidity, settings.humidity_change_threshold);

        if !urgent && !(interval_passed && drifted) {
            return None;
        }

        self.last_refresh_ms = Some(now_ms);
        self.last_target = Some(target);
        self.last_current = Some(current);
        self.last_humidity = Some(humidity);
        self.last_heating = snapshot.heating;

        Some(DisplayFrame {
            current_temp: current,
            target_temp: (snapshot.mode != ThermostatMode::Off).then_some(target),
            humidity,
            heating: snapshot.heating,
            date: format_date(wall_clock, settings),
        })
    }
}
