use chrono::{DateTime, Utc};
use rdkafka::message::{BorrowedMessage, Message};
use serde::{Deserialize, Serialize};

use crate::offset_map::Partition;

/// One device state-update event as read off the wire. The payload stays raw
/// bytes until a dispatch worker decodes it, so malformed bytes surface as a
/// per-record apply failure (and dead-letter) instead of a poll-loop error.
#[derive(Debug, Clone)]
pub struct TelemetryRecord {
    pub partition: Partition,
    pub offset: i64,
    /// Device id. Records without a key can't be deduplicated or applied.
    pub key: String,
    /// Broker/create timestamp in milliseconds, -1 when the broker didn't
    /// provide one (a real timestamp always wins against it in dedup).
    pub timestamp_ms: i64,
    pub payload: Vec<u8>,
}

/// Why a polled message couldn't be turned into a [`TelemetryRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordDefect {
    MissingKey,
    EmptyPayload,
}

impl RecordDefect {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordDefect::MissingKey => "missing_key",
            RecordDefect::EmptyPayload => "empty_payload",
        }
    }
}

impl TelemetryRecord {
    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Result<Self, RecordDefect> {
        let key = match msg.key() {
            Some(key) if !key.is_empty() => String::from_utf8_lossy(key).into_owned(),
            _ => return Err(RecordDefect::MissingKey),
        };
        let payload = match msg.payload() {
            Some(payload) if !payload.is_empty() => payload.to_vec(),
            _ => return Err(RecordDefect::EmptyPayload),
        };

        Ok(Self {
            partition: Partition::new(msg.topic().to_string(), msg.partition()),
            offset: msg.offset(),
            key,
            timestamp_ms: msg.timestamp().to_millis().unwrap_or(-1),
            payload,
        })
    }

    pub fn reported_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DoorSensorTelemetry {
    pub open: bool,
    pub battery_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnergyMeterTelemetry {
    pub power_w: f64,
    pub energy_kwh: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmartLightTelemetry {
    pub on: bool,
    pub brightness_pct: u8,
    pub color_temp_k: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmartPlugTelemetry {
    pub on: bool,
    pub power_w: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SoilMoistureTelemetry {
    pub moisture_pct: f64,
    pub battery_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemperatureTelemetry {
    pub temperature_c: f64,
    pub humidity_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThermostatMode {
    Off,
    Heat,
    Cool,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThermostatTelemetry {
    pub mode: ThermostatMode,
    pub target_temp_c: f64,
    pub current_temp_c: f64,
}

/// The closed set of telemetry payloads this pipeline understands. Adding a
/// device type means adding a variant here, which makes every match over the
/// set (notably the patch router) fail to compile until it's handled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryPayload {
    DoorSensor(DoorSensorTelemetry),
    EnergyMeter(EnergyMeterTelemetry),
    SmartLight(SmartLightTelemetry),
    SmartPlug(SmartPlugTelemetry),
    SoilMoistureSensor(SoilMoistureTelemetry),
    TemperatureSensor(TemperatureTelemetry),
    Thermostat(ThermostatTelemetry),
}

impl TelemetryPayload {
    /// Metric label for the device kind this payload belongs to.
    pub fn device_type(&self) -> &'static str {
        match self {
            TelemetryPayload::DoorSensor(_) => "door_sensor",
            TelemetryPayload::EnergyMeter(_) => "energy_meter",
            TelemetryPayload::SmartLight(_) => "smart_light",
            TelemetryPayload::SmartPlug(_) => "smart_plug",
            TelemetryPayload::SoilMoistureSensor(_) => "soil_moisture_sensor",
            TelemetryPayload::TemperatureSensor(_) => "temperature_sensor",
            TelemetryPayload::Thermostat(_) => "thermostat",
        }
    }
}
