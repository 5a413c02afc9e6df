//! Decoding of messages published by the device on its `up` topic.
//!
//! Data messages look like:
//!
//! ```text
//! {"type":"12","sensorData":[{"temperature":{"value":21.4},"co2":{"value":650}}]}
//! ```
//!
//! Decoding is pure: it turns a payload into a [`Decoded`] value and leaves
//! every registry write to the caller.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::mapping::SensorMetric;

/// Type tags of configuration acknowledgements, which carry no readings.
pub const ACK_TYPES: [&str; 2] = ["17", "13"];

/// Errors produced while decoding a payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not a valid message envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a well-formed message was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Configuration acknowledgement (type 13 or 17).
    Acknowledgement,
    /// Data message with an empty `sensorData` array.
    NoData,
}

/// Result of decoding a well-formed message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Reading(SensorReading),
    Ignored(IgnoreReason),
}

/// A single reading from the device. Absent fields are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReading {
    /// Temperature in °C.
    pub temperature: Option<f64>,
    /// Relative humidity in %.
    pub humidity: Option<f64>,
    /// CO2 in ppm.
    pub co2: Option<i64>,
    /// PM2.5 in µg/m³.
    pub pm25: Option<f64>,
    /// PM10 in µg/m³.
    pub pm10: Option<f64>,
    /// TVOC in ppb.
    pub tvoc: Option<f64>,
    /// Battery level in %.
    pub battery: Option<i64>,
    /// When the reading was decoded.
    pub received_at: DateTime<Utc>,
}

impl SensorReading {
    /// Sensor gauges carried by this reading, as `(metric, value)` pairs.
    ///
    /// Only present fields are yielded; `LastUpdate` is never included.
    pub fn gauge_values(&self) -> impl Iterator<Item = (SensorMetric, f64)> + '_ {
        SensorMetric::SENSORS
            .into_iter()
            .filter_map(move |metric| self.value(metric).map(|v| (metric, v)))
    }

    /// Value of a single gauge, if present.
    pub fn value(&self, metric: SensorMetric) -> Option<f64> {
        match metric {
            SensorMetric::Temperature => self.temperature,
            SensorMetric::Humidity => self.humidity,
            SensorMetric::Co2 => self.co2.map(|v| v as f64),
            SensorMetric::Pm25 => self.pm25,
            SensorMetric::Pm10 => self.pm10,
            SensorMetric::Tvoc => self.tvoc,
            SensorMetric::Battery => self.battery.map(|v| v as f64),
            SensorMetric::LastUpdate => None,
        }
    }

    /// Whether the reading carries no sensor field at all.
    pub fn is_empty(&self) -> bool {
        self.gauge_values().next().is_none()
    }
}

/// Raw `up` message envelope.
#[derive(Debug, Deserialize)]
struct UpMessage {
    #[serde(rename = "type", default)]
    kind: String,
    /// Acknowledgements may send `null` here.
    #[serde(rename = "sensorData", default)]
    sensor_data: Option<Vec<HashMap<String, serde_json::Value>>>,
}

/// Decode a payload received on the device's `up` topic.
pub fn decode(payload: &[u8]) -> Result<Decoded, DecodeError> {
    decode_at(payload, Utc::now())
}

/// Decode a payload, stamping a reading with `received_at`.
pub fn decode_at(payload: &[u8], received_at: DateTime<Utc>) -> Result<Decoded, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let message: UpMessage = serde_json::from_str(text)?;
    let is_ack = ACK_TYPES.contains(&message.kind.as_str());
    let sensor_data = message.sensor_data.unwrap_or_default();

    let Some(entry) = sensor_data.first() else {
        let reason = if is_ack {
            IgnoreReason::Acknowledgement
        } else {
            IgnoreReason::NoData
        };
        return Ok(Decoded::Ignored(reason));
    };

    // A non-empty sensorData wins over the type tag: some firmware tags
    // data messages with "17" as well.
    if is_ack {
        debug!(kind = %message.kind, "Acknowledgement type tag carries sensor data, decoding it");
    }
    if sensor_data.len() > 1 {
        debug!(
            entries = sensor_data.len(),
            "Message carries several sensorData entries, using the first"
        );
    }

    Ok(Decoded::Reading(reading_from_entry(entry, received_at)))
}

fn reading_from_entry(
    entry: &HashMap<String, serde_json::Value>,
    received_at: DateTime<Utc>,
) -> SensorReading {
    let field = |metric: SensorMetric| -> Option<f64> {
        let raw = entry.get(metric.field_name())?;
        let value = raw.get("value").and_then(serde_json::Value::as_f64);
        if value.is_none() {
            debug!(field = metric.field_name(), %raw, "Skipping field without numeric value");
        }
        value
    };

    SensorReading {
        temperature: field(SensorMetric::Temperature),
        humidity: field(SensorMetric::Humidity),
        co2: field(SensorMetric::Co2).map(truncate),
        pm25: field(SensorMetric::Pm25),
        pm10: field(SensorMetric::Pm10),
        tvoc: field(SensorMetric::Tvoc),
        battery: field(SensorMetric::Battery).map(truncate),
        received_at,
    }
}

/// Truncate toward zero (`650.9 → 650`, `-1.5 → -1`).
fn truncate(value: f64) -> i64 {
    value.trunc() as i64
}
