//! Flood collector
//!
//! Edge-side acquisition for flood detection. Each cycle pairs a camera frame
//! with a weather-station reading, stamps it with metadata and publishes the
//! result as JSON telemetry over MQTT.
//!
//! # Pipeline
//!
//! Data flows one way:
//!
//! ```text
//! scheduler -> { ingest (frames), sensor (observations) } -> metadata -> formatter -> transport
//! ```
//!
//! - `ingest`: frame sources (recorded video, image sequences, synthetic `stub://` streams)
//! - `sensor`: Netatmo OAuth token lifecycle and station readings, plus a static sensor
//! - `metadata`: timestamp, location, camera identity and hint normalization
//! - `formatter`: RGB JPEG + base64 wire payloads
//! - `scheduler`: wall-clock paced acquisition loop aligned to video time
//! - `transport`: bounded, fire-and-forget MQTT publisher
//! - `config`: file + environment configuration, validated once at startup

use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod formatter;
pub mod frame;
pub mod ingest;
pub mod metadata;
pub mod scheduler;
pub mod sensor;
pub mod transport;

pub use config::CollectorConfig;
pub use formatter::{PayloadFormatter, TelemetryPayload};
pub use frame::{CapturedFrame, FrameData};
pub use ingest::{open_source, FrameSource, NextFrame};
pub use metadata::{Metadata, MetadataEnricher, Motion};
pub use scheduler::{
    capture_at, AcquisitionScheduler, Clock, Pipeline, RunSummary, StopSignal, SystemClock,
};
pub use sensor::{
    Observation, ObservationReader, ObservationSource, SensorError, StaticSensor,
};
pub use transport::{
    BrokerLink, LogSink, OverflowPolicy, PublishOutcome, TelemetryPublisher, TelemetrySink,
};

/// Current wall-clock time as fractional seconds since the unix epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
