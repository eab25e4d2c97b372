//! Reading producers for the publish task.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sensor_bus::{PeerId, Reading, ReadingError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Produces the next reading to publish.
pub trait ReadingSource: Send {
    fn next_reading(&mut self, sensor_id: &PeerId) -> Result<Reading, ReadingError>;
}

/// Synthetic readings: temperature in [20, 30) °C and humidity in [30, 40) %,
/// in steps of 0.01, stamped with the current time.
pub struct RandomReadings {
    rng: StdRng,
}

impl RandomReadings {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic sequence for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomReadings {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingSource for RandomReadings {
    fn next_reading(&mut self, sensor_id: &PeerId) -> Result<Reading, ReadingError> {
        let temperature = 20.0 + self.rng.random_range(0..1000) as f32 / 100.0;
        let humidity = 30.0 + self.rng.random_range(0..1000) as f32 / 100.0;
        Reading::from_peer(sensor_id.clone(), temperature, humidity, unix_timestamp())
    }
}

/// Current unix time in seconds, saturating at `i32::MAX`.
pub fn unix_timestamp() -> i32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    i32::try_from(secs).unwrap_or(i32::MAX)
}
