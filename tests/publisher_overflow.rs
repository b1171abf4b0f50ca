use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde_json::Value;

use flood_collector::metadata::Metadata;
use flood_collector::{
    BrokerLink, Observation, OverflowPolicy, PublishOutcome, TelemetryPayload, TelemetryPublisher,
};

/// Broker link that stays disconnected until told otherwise.
#[derive(Clone, Default)]
struct ScriptedLink {
    ready: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
    delivered: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl ScriptedLink {
    fn sequence_numbers(&self) -> Vec<u64> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, bytes)| {
                let value: Value = serde_json::from_slice(bytes).expect("json payload");
                value["metadata"]["sequence_number"].as_u64().expect("sequence")
            })
            .collect()
    }
}

impl BrokerLink for ScriptedLink {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("client request channel full"));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    fn disconnect(&mut self) {}
}

fn payload(sequence: u64) -> TelemetryPayload {
    let mut metadata = Metadata::new();
    metadata.insert("sequence_number", sequence);
    metadata.insert("motion", "slow");
    metadata.insert("resource_constrained", false);
    TelemetryPayload {
        image_data: "/9j/4AAQ".to_string(),
        sensor_data: Observation::default(),
        metadata,
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn drop_newest_keeps_the_first_ten() {
    let link = ScriptedLink::default();
    let publisher = TelemetryPublisher::with_link(
        Box::new(link.clone()),
        "sensor/data",
        10,
        OverflowPolicy::DropNewest,
    )
    .expect("publisher");

    let outcomes: Vec<PublishOutcome> = (0..15).map(|i| publisher.publish(payload(i))).collect();
    assert_eq!(
        outcomes.iter().filter(|o| **o == PublishOutcome::Queued).count(),
        10
    );
    assert_eq!(
        outcomes.iter().filter(|o| **o == PublishOutcome::Dropped).count(),
        5
    );
    assert_eq!(publisher.buffered(), 10);

    link.ready.store(true, Ordering::SeqCst);
    assert!(wait_until(|| link.delivered.lock().unwrap().len() == 10));
    assert_eq!(link.sequence_numbers(), (0..10).collect::<Vec<_>>());
    assert!(link
        .delivered
        .lock()
        .unwrap()
        .iter()
        .all(|(topic, _)| topic == "sensor/data"));

    let stats = publisher.close();
    assert_eq!(stats.enqueued, 10);
    assert_eq!(stats.dropped, 5);
    assert_eq!(stats.sent, 10);
}

#[test]
fn drop_oldest_keeps_the_last_ten() {
    let link = ScriptedLink::default();
    let publisher = TelemetryPublisher::with_link(
        Box::new(link.clone()),
        "sensor/data",
        10,
        OverflowPolicy::DropOldest,
    )
    .expect("publisher");

    for i in 0..15 {
        assert_eq!(publisher.publish(payload(i)), PublishOutcome::Queued);
    }
    assert_eq!(publisher.buffered(), 10);

    link.ready.store(true, Ordering::SeqCst);
    assert!(wait_until(|| link.delivered.lock().unwrap().len() == 10));
    assert_eq!(link.sequence_numbers(), (5..15).collect::<Vec<_>>());

    let stats = publisher.close();
    assert_eq!(stats.dropped, 5);
}

#[test]
fn wire_payload_carries_publish_timestamp() {
    let link = ScriptedLink::default();
    link.ready.store(true, Ordering::SeqCst);
    let publisher = TelemetryPublisher::with_link(
        Box::new(link.clone()),
        "sensor/data",
        10,
        OverflowPolicy::default(),
    )
    .expect("publisher");

    publisher.publish(payload(1));
    assert!(wait_until(|| link.delivered.lock().unwrap().len() == 1));
    publisher.close();

    let delivered = link.delivered.lock().unwrap();
    let value: Value = serde_json::from_slice(&delivered[0].1).unwrap();
    assert!(value["metadata"]["collector_publish_ts"].as_f64().unwrap() > 0.0);
    assert_eq!(value["sensor_data"]["temperature"], serde_json::json!(22.5));
    assert_eq!(value["image_data"], serde_json::json!("/9j/4AAQ"));
}

#[test]
fn send_failures_are_counted_not_raised() {
    let link = ScriptedLink::default();
    link.fail_sends.store(true, Ordering::SeqCst);
    link.ready.store(true, Ordering::SeqCst);
    let publisher = TelemetryPublisher::with_link(
        Box::new(link.clone()),
        "sensor/data",
        10,
        OverflowPolicy::default(),
    )
    .expect("publisher");

    for i in 0..3 {
        assert_eq!(publisher.publish(payload(i)), PublishOutcome::Queued);
    }
    assert!(wait_until(|| publisher.stats().failed == 3));
    let stats = publisher.close();
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.failed, 3);
}

#[test]
fn publish_never_blocks_while_disconnected() {
    let link = ScriptedLink::default();
    let publisher = TelemetryPublisher::with_link(
        Box::new(link),
        "sensor/data",
        10,
        OverflowPolicy::DropNewest,
    )
    .expect("publisher");

    let started = Instant::now();
    for i in 0..1_000 {
        publisher.publish(payload(i));
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(publisher.buffered(), 10);
}
