//! Shared State Store.
//!
//! Cross-component values live here, each in its own independently locked slot:
//!
//! - `counter`: seconds until the next scheduled broadcast, mirrored by the scheduler
//! - `weather`: latest [`WeatherSnapshot`] written by the weather sensor poller
//! - `position`: latest [`PositionSnapshot`] written by the GPS poller
//! - `messages`: recent text traffic shown on the dashboard
//!
//! Multi-field slots are replaced as a whole, so a reader sees either the old snapshot or the
//! new one, never a mix. Locks are held only for a clone or an assignment; nothing in here
//! performs I/O. A poisoned lock is recovered rather than propagated because every slot holds
//! a complete value at all times.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Upper bound on retained message log entries.
pub const MESSAGE_LOG_CAPACITY: usize = 500;

/// Latest environmental readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    /// Humidity sensor temperature, °C.
    pub temperature_primary: f64,
    /// Pressure sensor temperature, °C.
    pub temperature_secondary: f64,
    pub pressure_station_hpa: f64,
    pub pressure_sea_level_hpa: f64,
    pub humidity_percent: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl WeatherSnapshot {
    /// Build a snapshot from raw sensor values, reducing station pressure to sea level.
    pub fn from_station_reading(
        temperature_primary: f64,
        temperature_secondary: f64,
        pressure_station_hpa: f64,
        humidity_percent: f64,
        altitude_m: f64,
    ) -> Self {
        Self {
            temperature_primary,
            temperature_secondary,
            pressure_station_hpa,
            pressure_sea_level_hpa: sea_level_pressure_hpa(
                pressure_station_hpa,
                temperature_primary,
                altitude_m,
            ),
            humidity_percent,
            updated_at: Some(Utc::now()),
        }
    }

    /// One-line weather summary appended to beacons.
    pub fn beacon_line(&self) -> String {
        format!(
            "Temp: {:.1}C Hum: {:.1}% Pres: {:.1}hPa",
            self.temperature_primary, self.humidity_percent, self.pressure_sea_level_hpa
        )
    }
}

/// Barometric reduction of station pressure to sea level using the standard lapse rate.
pub fn sea_level_pressure_hpa(station_hpa: f64, temp_c: f64, altitude_m: f64) -> f64 {
    const LAPSE_RATE: f64 = 0.0065; // K/m
    const GRAVITY: f64 = 9.80665; // m/s^2
    const MOLAR_MASS: f64 = 0.0289644; // kg/mol
    const GAS_CONSTANT: f64 = 8.3144598; // J/(mol*K)

    let kelvin = temp_c + 273.15;
    let base = 1.0 - (LAPSE_RATE * altitude_m) / kelvin;
    if base <= 0.0 {
        return station_hpa;
    }
    let exponent = -GRAVITY * MOLAR_MASS / (GAS_CONSTANT * LAPSE_RATE);
    station_hpa * base.powf(exponent)
}

/// Latest GPS fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub fix: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
    pub gps_time: Option<DateTime<Utc>>,
    pub status: String,
    pub satellites_in_view: u32,
    pub satellites_in_fix: u32,
    pub course_deg: Option<f64>,
    pub speed_kmh: Option<f64>,
}

impl Default for PositionSnapshot {
    fn default() -> Self {
        Self {
            fix: false,
            latitude: 0.0,
            longitude: 0.0,
            altitude_m: 0.0,
            gps_time: None,
            status: "No info".to_string(),
            satellites_in_view: 0,
            satellites_in_fix: 0,
            course_deg: None,
            speed_kmh: None,
        }
    }
}

/// One line of the dashboard message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedMessage {
    pub from: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Slots {
    counter: Mutex<i64>,
    weather: Mutex<WeatherSnapshot>,
    position: Mutex<PositionSnapshot>,
    messages: Mutex<VecDeque<LoggedMessage>>,
}

/// Cloneable handle to the shared slots.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    slots: Arc<Slots>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> i64 {
        *lock(&self.slots.counter)
    }

    pub fn set_counter(&self, value: i64) {
        *lock(&self.slots.counter) = value;
    }

    pub fn weather(&self) -> WeatherSnapshot {
        lock(&self.slots.weather).clone()
    }

    pub fn set_weather(&self, snapshot: WeatherSnapshot) {
        *lock(&self.slots.weather) = snapshot;
    }

    pub fn position(&self) -> PositionSnapshot {
        lock(&self.slots.position).clone()
    }

    pub fn set_position(&self, snapshot: PositionSnapshot) {
        *lock(&self.slots.position) = snapshot;
    }

    /// Append to the message log, dropping the oldest entry once full.
    pub fn add_message(&self, from: &str, text: &str) {
        let entry = LoggedMessage {
            from: from.to_string(),
            text: text.to_string(),
            at: Utc::now(),
        };
        let mut log = lock(&self.slots.messages);
        if log.len() >= MESSAGE_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// Copy of the message log, oldest first.
    pub fn messages(&self) -> Vec<LoggedMessage> {
        lock(&self.slots.messages).iter().cloned().collect()
    }
}
