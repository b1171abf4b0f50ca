use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::formatter::DEFAULT_JPEG_QUALITY;
use crate::metadata::{Motion, DEFAULT_CAMERA_ID, DEFAULT_LOCATION};
use crate::sensor::{Credentials, EnvFileTokenStore, Observation};
use crate::transport::publisher::DEFAULT_BUFFER_CAPACITY;
use crate::transport::OverflowPolicy;

const DEFAULT_MQTT_BROKER: &str = "192.168.10.1";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTT_TOPIC: &str = "sensor/data";
const DEFAULT_MQTT_CLIENT_ID: &str = "flood-collector";
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
const DEFAULT_SOURCE_URI: &str = "stub://flood_video";
const DEFAULT_SOURCE_FPS: f64 = 10.0;
const DEFAULT_SOURCE_FRAMES: u64 = 300;
const DEFAULT_SOURCE_WIDTH: u32 = 320;
const DEFAULT_SOURCE_HEIGHT: u32 = 240;
const DEFAULT_INTERVAL_SECS: f64 = 1.0;
const DEFAULT_NETATMO_API: &str = "https://api.netatmo.com";
const DEFAULT_REDIRECT_URI: &str = "https://example.com";
const DEFAULT_TOKEN_FILE: &str = ".env";

const FALSY: &[&str] = &["0", "false", "no", "off", "n", "f"];
const TRUTHY: &[&str] = &["1", "true", "yes", "on", "y", "t"];

#[derive(Debug, Deserialize, Default)]
struct CollectorConfigFile {
    mqtt: Option<MqttConfigFile>,
    source: Option<SourceConfigFile>,
    sensor: Option<SensorConfigFile>,
    acquisition: Option<AcquisitionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    enabled: Option<bool>,
    broker: Option<String>,
    port: Option<u16>,
    topic: Option<String>,
    client_id: Option<String>,
    keep_alive_secs: Option<u64>,
    buffer_capacity: Option<usize>,
    overflow: Option<String>,
    use_tls: Option<bool>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    fps: Option<f64>,
    frames: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SensorConfigFile {
    simulate: Option<bool>,
    api_base: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
    sensor_id: Option<String>,
    token_file: Option<PathBuf>,
    #[serde(rename = "static")]
    static_reading: Option<StaticReadingFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StaticReadingFile {
    temperature: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct AcquisitionConfigFile {
    interval_secs: Option<f64>,
    camera_id: Option<String>,
    location: Option<String>,
    jpeg_quality: Option<u8>,
    motion: Option<String>,
    resource_constrained: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub mqtt: MqttSettings,
    pub source: SourceSettings,
    pub sensor: SensorSettings,
    pub acquisition: AcquisitionSettings,
}

#[derive(Clone)]
pub struct MqttSettings {
    /// When false, payloads are logged instead of published.
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
    pub use_tls: bool,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSettings")
            .field("enabled", &self.enabled)
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("topic", &self.topic)
            .field("client_id", &self.client_id)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("overflow", &self.overflow)
            .field("use_tls", &self.use_tls)
            .field("tls_ca_path", &self.tls_ca_path)
            .field("tls_client_cert_path", &self.tls_client_cert_path)
            .field("tls_client_key_path", &self.tls_client_key_path)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Video file, image directory or `stub://` stream.
    pub uri: String,
    pub fps: f64,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            uri: DEFAULT_SOURCE_URI.to_string(),
            fps: DEFAULT_SOURCE_FPS,
            frames: DEFAULT_SOURCE_FRAMES,
            width: DEFAULT_SOURCE_WIDTH,
            height: DEFAULT_SOURCE_HEIGHT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SensorSettings {
    /// Serve `static_reading` instead of querying the station.
    pub simulate: bool,
    pub static_reading: Observation,
    pub api_base: String,
    pub credentials: Credentials,
    pub sensor_id: Option<String>,
    /// Dotenv-style file refreshed tokens are written back to.
    pub token_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    pub interval_secs: f64,
    pub camera_id: String,
    pub location: String,
    pub jpeg_quality: u8,
    pub motion: Motion,
    pub resource_constrained: bool,
}

impl CollectorConfig {
    /// Load from the file named by `FLOOD_CONFIG` (if any), then the environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FLOOD_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CollectorConfigFile) -> Result<Self> {
        let mqtt_file = file.mqtt.unwrap_or_default();
        let overflow = match mqtt_file.overflow.as_deref() {
            Some(policy) => policy.parse()?,
            None => OverflowPolicy::default(),
        };
        let mqtt = MqttSettings {
            enabled: mqtt_file.enabled.unwrap_or(true),
            broker: mqtt_file
                .broker
                .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
            port: mqtt_file.port.unwrap_or(DEFAULT_MQTT_PORT),
            topic: mqtt_file
                .topic
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
            client_id: mqtt_file
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            keep_alive_secs: mqtt_file.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
            buffer_capacity: mqtt_file.buffer_capacity.unwrap_or(DEFAULT_BUFFER_CAPACITY),
            overflow,
            use_tls: mqtt_file.use_tls.unwrap_or(false),
            tls_ca_path: mqtt_file.tls_ca_path,
            tls_client_cert_path: mqtt_file.tls_client_cert_path,
            tls_client_key_path: mqtt_file.tls_client_key_path,
            username: mqtt_file.username,
            password: mqtt_file.password,
        };

        let source_file = file.source.unwrap_or_default();
        let defaults = SourceSettings::default();
        let source = SourceSettings {
            uri: source_file.uri.unwrap_or(defaults.uri),
            fps: source_file.fps.unwrap_or(defaults.fps),
            frames: source_file.frames.unwrap_or(defaults.frames),
            width: source_file.width.unwrap_or(defaults.width),
            height: source_file.height.unwrap_or(defaults.height),
        };

        let sensor_file = file.sensor.unwrap_or_default();
        let baseline = Observation::default();
        let static_file = sensor_file.static_reading.unwrap_or_default();
        let sensor = SensorSettings {
            simulate: sensor_file.simulate.unwrap_or(false),
            static_reading: Observation {
                temperature: static_file.temperature.unwrap_or(baseline.temperature),
                humidity: static_file.humidity.unwrap_or(baseline.humidity),
                pressure: static_file.pressure.unwrap_or(baseline.pressure),
            },
            api_base: sensor_file
                .api_base
                .unwrap_or_else(|| DEFAULT_NETATMO_API.to_string()),
            credentials: Credentials {
                client_id: sensor_file.client_id.unwrap_or_default(),
                client_secret: sensor_file.client_secret.unwrap_or_default(),
                redirect_uri: sensor_file
                    .redirect_uri
                    .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
                access_token: None,
                refresh_token: None,
            },
            sensor_id: sensor_file.sensor_id,
            token_file: sensor_file
                .token_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_FILE)),
        };

        let acquisition_file = file.acquisition.unwrap_or_default();
        let acquisition = AcquisitionSettings {
            interval_secs: acquisition_file
                .interval_secs
                .unwrap_or(DEFAULT_INTERVAL_SECS),
            camera_id: acquisition_file
                .camera_id
                .unwrap_or_else(|| DEFAULT_CAMERA_ID.to_string()),
            location: acquisition_file
                .location
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            jpeg_quality: acquisition_file
                .jpeg_quality
                .unwrap_or(DEFAULT_JPEG_QUALITY),
            motion: acquisition_file
                .motion
                .map(|m| Motion::from_value(&serde_json::Value::String(m)))
                .unwrap_or_default(),
            resource_constrained: acquisition_file.resource_constrained.unwrap_or(false),
        };

        Ok(Self {
            mqtt,
            source,
            sensor,
            acquisition,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(broker) = env_string("FLOOD_MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(port) = env_string("FLOOD_MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .map_err(|_| anyhow!("FLOOD_MQTT_PORT must be a port number, got '{}'", port))?;
        }
        if let Some(topic) = env_string("FLOOD_MQTT_TOPIC") {
            self.mqtt.topic = topic;
        }
        if let Some(enabled) = env_bool("FLOOD_USE_MQTT")? {
            self.mqtt.enabled = enabled;
        }
        if let Some(user) = env_string("FLOOD_MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Some(password) = env_string("FLOOD_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(policy) = env_string("FLOOD_OVERFLOW_POLICY") {
            self.mqtt.overflow = policy.parse()?;
        }
        if let Some(uri) = env_string("FLOOD_SOURCE") {
            self.source.uri = uri;
        }
        if let Some(interval) = env_string("FLOOD_INTERVAL_SECS") {
            self.acquisition.interval_secs = interval.parse().map_err(|_| {
                anyhow!("FLOOD_INTERVAL_SECS must be a number of seconds, got '{}'", interval)
            })?;
        }
        if let Some(camera_id) = env_string("FLOOD_CAMERA_ID") {
            self.acquisition.camera_id = camera_id;
        }
        if let Some(simulate) = env_bool("FLOOD_SIMULATE_SENSOR")? {
            self.sensor.simulate = simulate;
        }
        if let Some(path) = env_string("FLOOD_TOKEN_FILE") {
            self.sensor.token_file = PathBuf::from(path);
        }

        let creds = &mut self.sensor.credentials;
        if let Some(client_id) = env_string("NETATMO_CLIENT_ID") {
            creds.client_id = client_id;
        }
        if let Some(secret) = env_string("NETATMO_CLIENT_SECRET") {
            creds.client_secret = secret;
        }
        if let Some(redirect) = env_string("NETATMO_REDIRECT_URI") {
            creds.redirect_uri = redirect;
        }
        let (saved_access, saved_refresh) = EnvFileTokenStore::new(&self.sensor.token_file)
            .load()
            .context("load saved Netatmo tokens")?;
        creds.access_token = env_string("NETATMO_ACCESS_TOKEN").or(saved_access);
        creds.refresh_token = env_string("NETATMO_REFRESH_TOKEN").or(saved_refresh);
        if let Some(sensor_id) =
            env_string("NETATMO_SENSOR_ID").or_else(|| env_string("NETATMO_SENSOR_ID_INDOOR"))
        {
            self.sensor.sensor_id = Some(sensor_id);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let interval = self.acquisition.interval_secs;
        if !interval.is_finite() || interval <= 0.0 {
            return Err(anyhow!(
                "acquisition interval must be greater than zero, got {}",
                interval
            ));
        }
        if self.mqtt.topic.trim().is_empty() {
            return Err(anyhow!("MQTT topic must not be empty"));
        }
        if self.mqtt.broker.trim().is_empty() {
            return Err(anyhow!("MQTT broker must not be empty"));
        }
        if self.mqtt.buffer_capacity == 0 {
            return Err(anyhow!("MQTT buffer capacity must be greater than zero"));
        }
        if self.mqtt.keep_alive_secs == 0 {
            return Err(anyhow!("MQTT keep-alive must be greater than zero"));
        }
        if !(1..=100).contains(&self.acquisition.jpeg_quality) {
            return Err(anyhow!(
                "JPEG quality must be within 1..=100, got {}",
                self.acquisition.jpeg_quality
            ));
        }
        if self.source.uri.trim().is_empty() {
            return Err(anyhow!("frame source must not be empty"));
        }
        if !self.source.fps.is_finite() || self.source.fps <= 0.0 {
            return Err(anyhow!("source fps must be greater than zero"));
        }

        if self.sensor.simulate {
            let reading = self.sensor.static_reading;
            if ![reading.temperature, reading.humidity, reading.pressure]
                .iter()
                .all(|v| v.is_finite())
            {
                return Err(anyhow!("static sensor readings must be finite numbers"));
            }
        } else {
            let creds = &self.sensor.credentials;
            if creds.client_id.trim().is_empty() || creds.client_secret.trim().is_empty() {
                return Err(anyhow!(
                    "NETATMO_CLIENT_ID and NETATMO_CLIENT_SECRET are required unless the sensor is simulated"
                ));
            }
            if creds.redirect_uri.trim().is_empty() {
                return Err(anyhow!("NETATMO_REDIRECT_URI must not be empty"));
            }
            url::Url::parse(&self.sensor.api_base)
                .with_context(|| format!("invalid Netatmo API base '{}'", self.sensor.api_base))?;
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CollectorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    let Some(value) = env_string(key) else {
        return Ok(None);
    };
    parse_flag(&value)
        .map(Some)
        .ok_or_else(|| anyhow!("{} must be a boolean flag, got '{}'", key, value))
}

fn parse_flag(value: &str) -> Option<bool> {
    let lowered = value.trim().to_ascii_lowercase();
    if TRUTHY.contains(&lowered.as_str()) {
        Some(true)
    } else if FALSY.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}
