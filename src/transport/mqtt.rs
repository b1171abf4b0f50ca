//! MQTT broker link over rumqttc (MQTT v5).
//!
//! One persistent connection per link. A background thread drives the
//! rumqttc event loop; rumqttc reconnects on the next poll after an error,
//! so the thread only tracks readiness and paces retries.

use anyhow::{Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::publisher::BrokerLink;
use super::tls::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};
use crate::config::MqttSettings;

/// Pause between reconnect attempts after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct MqttLink {
    client: Client,
    endpoint: MqttEndpoint,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttLink {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker, settings.port, settings.use_tls)?;
        let materials = TlsMaterials::load(
            settings.tls_ca_path.as_deref(),
            settings.tls_client_cert_path.as_deref(),
            settings.tls_client_key_path.as_deref(),
        )?;

        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        options.set_transport(endpoint.build_transport(&materials)?);

        let (client, connection) = Client::new(options, 10);
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_event_loop(
            connection,
            endpoint.clone(),
            Arc::clone(&connected),
            Arc::clone(&shutdown),
        )?;
        log::info!(
            "MQTT connecting to {} (client_id: {}, auth: {})",
            endpoint,
            settings.client_id,
            settings.username.is_some()
        );

        Ok(Self {
            client,
            endpoint,
            connected,
            shutdown,
            connection_handle: Some(handle),
        })
    }
}

fn spawn_event_loop(
    mut connection: Connection,
    endpoint: MqttEndpoint,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-event-loop".to_string())
        .spawn(move || {
            for event in connection.iter() {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        log::info!("MQTT connected to {}", endpoint);
                    }
                    Ok(Event::Incoming(Incoming::Disconnect(_))) => {
                        connected.store(false, Ordering::SeqCst);
                        log::warn!("MQTT broker {} sent disconnect", endpoint);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected.swap(false, Ordering::SeqCst) {
                            log::warn!("MQTT connection to {} lost: {}", endpoint, e);
                        } else {
                            log::debug!("MQTT connect to {} failed: {}", endpoint, e);
                        }
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        std::thread::sleep(RECONNECT_DELAY);
                    }
                }
            }
        })
        .context("spawn MQTT event loop thread")
}

impl BrokerLink for MqttLink {
    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .with_context(|| format!("queue publish to {}", self.endpoint))?;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect request not queued: {}", e);
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        log::info!("MQTT disconnected from {}", self.endpoint);
    }
}
