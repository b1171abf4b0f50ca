//! Telemetry metadata.
//!
//! Metadata is an open JSON object: the collector owns a handful of keys and
//! passes every other caller key through untouched. Two hint fields are
//! normalized before a payload leaves the collector:
//! - `motion`: one of `fast`, `slow`, `stop` (anything else reads as `slow`)
//! - `resource_constrained`: a JSON boolean
//!
//! Normalization is idempotent, so re-normalizing a published payload's
//! metadata leaves it unchanged.

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::frame::CapturedFrame;

pub const DEFAULT_LOCATION: &str = "50.8503,4.3517";
pub const DEFAULT_CAMERA_ID: &str = "video_camera_01";

const TRUTHY: &[&str] = &["1", "true", "yes", "on", "y", "t"];

/// Movement hint attached by the caller (e.g. a drone reporting its own speed).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Motion {
    Fast,
    #[default]
    Slow,
    Stop,
}

impl Motion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
            Self::Stop => "stop",
        }
    }

    /// Interpret an arbitrary hint value. Unrecognized input is `Slow`.
    pub fn from_value(value: &Value) -> Self {
        match value.as_str().map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("fast") => Self::Fast,
            Some("stop") => Self::Stop,
            _ => Self::Slow,
        }
    }
}

/// Interpret an arbitrary flag value as a boolean.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => TRUTHY.contains(&s.trim().to_ascii_lowercase().as_str()),
        _ => false,
    }
}

/// Metadata attached to one telemetry payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn motion(&self) -> Motion {
        self.get("motion").map(Motion::from_value).unwrap_or_default()
    }

    pub fn resource_constrained(&self) -> bool {
        self.get("resource_constrained").map(truthy).unwrap_or(false)
    }

    /// Rewrite `motion` and `resource_constrained` into canonical form.
    pub fn normalize_hints(&mut self) {
        let motion = self.motion();
        let constrained = self.resource_constrained();
        self.insert("motion", motion.as_str());
        self.insert("resource_constrained", constrained);
    }

    /// Stamp `collector_publish_ts` and make sure `collector_capture_ts`, if
    /// present, is numeric. Unparseable capture stamps are dropped.
    pub fn stamp_publish_time(&mut self, now: f64) {
        if let Some(capture) = self.remove("collector_capture_ts") {
            let numeric = match &capture {
                Value::Number(_) => Some(capture.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number),
                _ => None,
            };
            match numeric {
                Some(value) => self.insert("collector_capture_ts", value),
                None => log::warn!("dropping non-numeric collector_capture_ts {}", capture),
            }
        }
        if let Some(now) = Number::from_f64(now) {
            self.insert("collector_publish_ts", Value::Number(now));
        }
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Stamps frames with collector identity and capture details.
#[derive(Clone, Debug)]
pub struct MetadataEnricher {
    pub camera_id: String,
    pub location: String,
    /// Defaults for the hint fields when the caller supplies none.
    pub motion: Motion,
    pub resource_constrained: bool,
}

impl Default for MetadataEnricher {
    fn default() -> Self {
        Self {
            camera_id: DEFAULT_CAMERA_ID.to_string(),
            location: DEFAULT_LOCATION.to_string(),
            motion: Motion::default(),
            resource_constrained: false,
        }
    }
}

impl MetadataEnricher {
    pub fn new(camera_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            location: location.into(),
            ..Self::default()
        }
    }

    /// Build the metadata for `frame`, layered over caller-supplied `extra`.
    ///
    /// Collector keys (`timestamp`, `location`, `camera_id`, capture fields)
    /// always reflect this collector; hint fields from `extra` win over the
    /// configured defaults.
    pub fn enrich(&self, frame: &CapturedFrame, mut extra: Metadata) -> Metadata {
        extra.insert("timestamp", iso_timestamp(frame.capture_wall_time));
        extra.insert("location", self.location.as_str());
        extra.insert("camera_id", self.camera_id.as_str());
        if let Some(ts) = Number::from_f64(frame.capture_wall_time) {
            extra.insert("collector_capture_ts", Value::Number(ts));
        }
        if let Some(video_ts) = frame.video_timestamp_sec.and_then(Number::from_f64) {
            extra.insert("video_timestamp_sec", Value::Number(video_ts));
        }
        if let Some(origin) = &frame.origin {
            extra.insert("video_file", origin.as_str());
        }
        extra.insert("sequence_number", frame.index);

        if !extra.contains_key("motion") {
            extra.insert("motion", self.motion.as_str());
        }
        if !extra.contains_key("resource_constrained") {
            extra.insert("resource_constrained", self.resource_constrained);
        }
        extra.normalize_hints();
        extra
    }
}

fn iso_timestamp(unix_seconds: f64) -> String {
    let secs = unix_seconds.floor();
    let nanos = ((unix_seconds - secs) * 1e9).round().min(999_999_999.0) as u32;
    Utc.timestamp_opt(secs as i64, nanos)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
