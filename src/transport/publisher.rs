//! Bounded, fire-and-forget telemetry publisher.
//!
//! `publish` serializes the payload and parks it in a fixed-size outbound
//! buffer, then returns. A delivery thread drains the buffer into the broker
//! link once the link reports a live connection. When the buffer is full the
//! overflow policy decides which payload is lost; the caller is never blocked
//! and never sees an error.

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use super::mqtt::MqttLink;
use crate::config::MqttSettings;
use crate::formatter::TelemetryPayload;
use crate::unix_now;

pub const DEFAULT_BUFFER_CAPACITY: usize = 10;

/// How often the delivery thread re-checks link readiness while idle.
const READY_POLL: Duration = Duration::from_millis(50);

/// Which payload to discard when the outbound buffer is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the incoming payload; keep what is already queued.
    #[default]
    DropNewest,
    /// Evict the oldest queued payload to make room.
    DropOldest,
}

impl FromStr for OverflowPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "drop_newest" | "newest" => Ok(Self::DropNewest),
            "drop_oldest" | "oldest" => Ok(Self::DropOldest),
            other => Err(anyhow!(
                "unknown overflow policy '{}': expected 'drop_newest' or 'drop_oldest'",
                other
            )),
        }
    }
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DropNewest => write!(f, "drop_newest"),
            Self::DropOldest => write!(f, "drop_oldest"),
        }
    }
}

/// What happened to a payload handed to `publish`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Buffered for delivery.
    Queued,
    /// Discarded because the buffer was full.
    Dropped,
    /// Not accepted: the publisher is closed or the payload would not serialize.
    Rejected,
}

/// Connection the delivery thread writes to.
pub trait BrokerLink: Send {
    /// True once the broker has acknowledged the connection.
    fn is_ready(&self) -> bool;

    /// Hand one message to the client. QoS 0: no acknowledgement, no retry.
    fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;

    fn disconnect(&mut self);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub enqueued: u64,
    pub sent: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Default)]
struct Outbound {
    items: VecDeque<Vec<u8>>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Outbound>,
    wake: Condvar,
    counters: Counters,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Outbound> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct TelemetryPublisher {
    topic: String,
    capacity: usize,
    policy: OverflowPolicy,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TelemetryPublisher {
    /// Open the MQTT connection described by `settings` and start delivery.
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let link = MqttLink::connect(settings)?;
        Self::with_link(
            Box::new(link),
            settings.topic.clone(),
            settings.buffer_capacity,
            settings.overflow,
        )
    }

    /// Start delivery over an existing link.
    pub fn with_link(
        link: Box<dyn BrokerLink>,
        topic: impl Into<String>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Result<Self> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(anyhow!("MQTT topic must not be empty"));
        }
        if capacity == 0 {
            return Err(anyhow!("outbound buffer capacity must be at least 1"));
        }

        let shared = Arc::new(Shared::default());
        let worker = {
            let shared = Arc::clone(&shared);
            let topic = topic.clone();
            std::thread::Builder::new()
                .name("telemetry-delivery".to_string())
                .spawn(move || deliver(link, &topic, &shared))
                .context("spawn telemetry delivery thread")?
        };
        log::info!(
            "telemetry publisher ready: topic={} capacity={} overflow={}",
            topic,
            capacity,
            policy
        );
        Ok(Self {
            topic,
            capacity,
            policy,
            shared,
            worker: Some(worker),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Queue `payload` for delivery. Never blocks on the network, never errors.
    pub fn publish(&self, payload: TelemetryPayload) -> PublishOutcome {
        let counters = &self.shared.counters;
        let bytes = match encode_wire(payload, unix_now()) {
            Ok(bytes) => bytes,
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("telemetry payload not serializable: {:#}", e);
                return PublishOutcome::Rejected;
            }
        };

        let mut queue = self.shared.lock();
        if queue.closed {
            log::warn!("publish after close; payload discarded");
            return PublishOutcome::Rejected;
        }
        if queue.items.len() >= self.capacity {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            match self.policy {
                OverflowPolicy::DropNewest => {
                    log::warn!(
                        "outbound buffer full ({}); dropping newest payload",
                        self.capacity
                    );
                    return PublishOutcome::Dropped;
                }
                OverflowPolicy::DropOldest => {
                    queue.items.pop_front();
                    log::warn!(
                        "outbound buffer full ({}); dropped oldest payload",
                        self.capacity
                    );
                }
            }
        }
        queue.items.push_back(bytes);
        counters.enqueued.fetch_add(1, Ordering::Relaxed);
        drop(queue);
        self.shared.wake.notify_one();
        PublishOutcome::Queued
    }

    /// Payloads waiting for delivery.
    pub fn buffered(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn stats(&self) -> PublisherStats {
        let c = &self.shared.counters;
        PublisherStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            sent: c.sent.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop delivery, disconnect the link and join the delivery thread.
    ///
    /// Payloads still buffered are flushed if the link is up, dropped otherwise.
    pub fn close(mut self) -> PublisherStats {
        self.shutdown();
        let stats = self.stats();
        log::info!(
            "telemetry publisher closed: enqueued={} sent={} dropped={} failed={}",
            stats.enqueued,
            stats.sent,
            stats.dropped,
            stats.failed
        );
        stats
    }

    fn shutdown(&mut self) {
        self.shared.lock().closed = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("telemetry delivery thread panicked");
            }
        }
    }
}

impl Drop for TelemetryPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serialize `payload` for the wire, stamping the publish time.
pub fn encode_wire(mut payload: TelemetryPayload, now: f64) -> Result<Vec<u8>> {
    payload.metadata.stamp_publish_time(now);
    serde_json::to_vec(&payload).context("serialize telemetry payload")
}

fn deliver(mut link: Box<dyn BrokerLink>, topic: &str, shared: &Shared) {
    let counters = &shared.counters;
    loop {
        let next = {
            let mut queue = shared.lock();
            loop {
                if queue.closed {
                    break None;
                }
                if !queue.items.is_empty() && link.is_ready() {
                    break queue.items.pop_front();
                }
                queue = shared
                    .wake
                    .wait_timeout(queue, READY_POLL)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|e| e.into_inner().0);
            }
        };
        let Some(bytes) = next else { break };
        send_one(link.as_mut(), topic, bytes, counters);
    }

    let leftover: Vec<Vec<u8>> = shared.lock().items.drain(..).collect();
    if !leftover.is_empty() {
        if link.is_ready() {
            for bytes in leftover {
                send_one(link.as_mut(), topic, bytes, counters);
            }
        } else {
            log::warn!(
                "discarding {} buffered payloads; broker never connected",
                leftover.len()
            );
            counters
                .dropped
                .fetch_add(leftover.len() as u64, Ordering::Relaxed);
        }
    }
    link.disconnect();
}

fn send_one(link: &mut dyn BrokerLink, topic: &str, bytes: Vec<u8>, counters: &Counters) {
    let len = bytes.len();
    match link.send(topic, bytes) {
        Ok(()) => {
            counters.sent.fetch_add(1, Ordering::Relaxed);
            log::debug!("published {} bytes to {}", len, topic);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("publish to {} failed: {:#}", topic, e);
        }
    }
}
