//! Telemetry delivery.
//!
//! The acquisition loop hands finished payloads to a `TelemetrySink`. The
//! production sink is `TelemetryPublisher`: a bounded outbound buffer drained
//! by a delivery thread into an MQTT link. `LogSink` stands in for it when
//! MQTT is disabled or in dry runs.

use crate::formatter::TelemetryPayload;

pub mod mqtt;
pub mod publisher;
mod tls;

pub use mqtt::MqttLink;
pub use publisher::{
    BrokerLink, OverflowPolicy, PublishOutcome, PublisherStats, TelemetryPublisher,
};
pub use tls::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials, DEFAULT_MQTT_PORT};

/// Destination for finished payloads. Submitting never blocks on the network
/// and never fails the caller.
pub trait TelemetrySink: Send + Sync {
    fn submit(&self, payload: TelemetryPayload) -> PublishOutcome;
}

/// Logs a summary of each payload instead of sending it.
#[derive(Clone, Debug, Default)]
pub struct LogSink {
    topic: String,
}

impl LogSink {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

impl TelemetrySink for LogSink {
    fn submit(&self, payload: TelemetryPayload) -> PublishOutcome {
        log::info!(
            "[dry-run] {}: image={}B temperature={} humidity={} pressure={} metadata={}",
            self.topic,
            payload.image_data.len(),
            payload.sensor_data.temperature,
            payload.sensor_data.humidity,
            payload.sensor_data.pressure,
            serde_json::to_string(&payload.metadata).unwrap_or_default()
        );
        PublishOutcome::Queued
    }
}

impl TelemetrySink for TelemetryPublisher {
    fn submit(&self, payload: TelemetryPayload) -> PublishOutcome {
        self.publish(payload)
    }
}
