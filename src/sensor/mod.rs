//! Environmental observations.
//!
//! Two readers feed the acquisition loop through `ObservationSource`:
//! - `ObservationReader`: a Netatmo weather station behind OAuth. Owns the
//!   credential set and keeps it alive across expiry and revocation.
//! - `StaticSensor`: fixed readings for simulated or video-only deployments.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod netatmo;
mod reader;
pub mod store;
pub mod token;

pub use netatmo::{ApiError, NetatmoApi, StationApi, StationsBody};
pub use reader::ObservationReader;
pub use store::{AuthorizationPrompt, EnvFileTokenStore, MemoryTokenStore, StdinPrompt, TokenStore};
pub use token::{is_expired, ClientCredentials, Credentials, TokenPair, TokenState};

/// One environmental reading.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity, percent.
    pub humidity: f64,
    /// Pressure, hPa.
    pub pressure: f64,
}

impl Default for Observation {
    fn default() -> Self {
        Self {
            temperature: 22.5,
            humidity: 55.0,
            pressure: 1013.25,
        }
    }
}

/// Failure to produce an observation.
///
/// Everything except `Authorization` is contained to the current cycle; the
/// next tick tries again.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("token refresh failed: {0}")]
    Refresh(#[source] ApiError),

    #[error("access token rejected twice; giving up this cycle")]
    Rejected,

    #[error("station data request failed: {0}")]
    Fetch(#[source] ApiError),

    #[error("no usable station reading: {0}")]
    NoReading(String),

    #[error("failed to persist refreshed tokens: {0}")]
    Persist(String),

    /// Refresh and reauthorization both exhausted.
    #[error("authorization failed: {0}")]
    Authorization(String),
}

impl SensorError {
    /// Fatal errors stop the acquisition loop; the rest skip one cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authorization(_))
    }
}

/// Anything that can produce the latest observation.
pub trait ObservationSource: Send + Sync {
    fn read(&self) -> Result<Observation, SensorError>;
}

/// Fixed readings, returned unchanged on every call.
#[derive(Clone, Debug)]
pub struct StaticSensor {
    observation: Observation,
}

impl StaticSensor {
    pub fn new(observation: Observation) -> Self {
        log::info!(
            "static sensor: temperature={} humidity={} pressure={}",
            observation.temperature,
            observation.humidity,
            observation.pressure
        );
        Self { observation }
    }
}

impl ObservationSource for StaticSensor {
    fn read(&self) -> Result<Observation, SensorError> {
        Ok(self.observation)
    }
}
