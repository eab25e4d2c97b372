//! Sensor reading payload carried on the bus.

use crate::peer_id::{PeerId, PeerIdError};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ReadingError {
    #[error("Invalid sensor id: {0}")]
    SensorId(#[from] PeerIdError),
    #[error("Temperature must be finite, got {0}")]
    Temperature(f32),
    #[error("Humidity must be finite, got {0}")]
    Humidity(f32),
}

/// A single temperature/humidity sample.
///
/// Immutable once constructed: fields are only readable through accessors,
/// and `Reading::new` is the only way to build one, so every value on the
/// bus has a valid sensor id and finite measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawReading", into = "RawReading")]
pub struct Reading {
    sensor_id: PeerId,
    temperature: f32,
    humidity: f32,
    timestamp: i32,
}

impl Reading {
    /// Build a reading. `timestamp` is unix seconds.
    pub fn new(
        sensor_id: impl AsRef<str>,
        temperature: f32,
        humidity: f32,
        timestamp: i32,
    ) -> Result<Self, ReadingError> {
        let sensor_id = PeerId::new(sensor_id)?;
        Self::from_peer(sensor_id, temperature, humidity, timestamp)
    }

    /// Build a reading for an already-validated node identity.
    pub fn from_peer(
        sensor_id: PeerId,
        temperature: f32,
        humidity: f32,
        timestamp: i32,
    ) -> Result<Self, ReadingError> {
        if !temperature.is_finite() {
            return Err(ReadingError::Temperature(temperature));
        }
        if !humidity.is_finite() {
            return Err(ReadingError::Humidity(humidity));
        }
        Ok(Self {
            sensor_id,
            temperature,
            humidity,
            timestamp,
        })
    }

    pub fn sensor_id(&self) -> &PeerId {
        &self.sensor_id
    }

    /// Degrees Celsius.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Relative humidity in percent.
    pub fn humidity(&self) -> f32 {
        self.humidity
    }

    /// Unix seconds.
    pub fn timestamp(&self) -> i32 {
        self.timestamp
    }
}

impl Display for Reading {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:.2}°C, {:.2}%, ts={}",
            self.sensor_id, self.temperature, self.humidity, self.timestamp
        )
    }
}

/// Wire shape of a reading; validated into `Reading` on deserialize.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReading {
    sensor_id: String,
    temperature: f32,
    humidity: f32,
    timestamp: i32,
}

impl TryFrom<RawReading> for Reading {
    type Error = ReadingError;

    fn try_from(raw: RawReading) -> Result<Self, Self::Error> {
        Reading::new(raw.sensor_id, raw.temperature, raw.humidity, raw.timestamp)
    }
}

impl From<Reading> for RawReading {
    fn from(reading: Reading) -> Self {
        Self {
            sensor_id: reading.sensor_id.to_string(),
            temperature: reading.temperature,
            humidity: reading.humidity,
            timestamp: reading.timestamp,
        }
    }
}
