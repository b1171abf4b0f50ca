//! Broker endpoint parsing and TLS transport selection.
//!
//! - CA verification: custom CA path or the bundled webpki roots
//! - Client certificates: mutual TLS when both cert and key are given
//! - Insecure mode: not supported

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::Path;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTTS_PORT: u16 = 8883;

/// TLS certificate materials for MQTT connections.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// PEM-encoded CA certificate bytes. `None` uses the bundled roots.
    pub ca: Option<Vec<u8>>,

    /// PEM client certificate and key for mutual TLS.
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    /// Load TLS materials from file paths. Client cert and key must be
    /// provided together.
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read MQTT TLS client cert '{}'", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read MQTT TLS client key '{}'", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }
}

/// Resolved broker address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl MqttEndpoint {
    pub fn build_transport(&self, materials: &TlsMaterials) -> Result<Transport> {
        if !self.use_tls {
            if materials.is_configured() {
                return Err(anyhow!(
                    "MQTT TLS materials provided but TLS is disabled; \
                     use an mqtts:// broker address or set mqtt.use_tls"
                ));
            }
            return Ok(Transport::tcp());
        }

        if !materials.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = materials.ca.clone().ok_or_else(|| {
            anyhow!("MQTT TLS CA certificate is required when providing client certificates")
        })?;
        Ok(Transport::tls(ca, materials.client_auth.clone(), None))
    }
}

impl std::fmt::Display for MqttEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// Parse a broker address.
///
/// Supports `host`, `host:port`, `[ipv6]:port` and the `mqtt://`, `tcp://`,
/// `mqtts://`, `ssl://` schemes. Without an explicit port, `default_port`
/// is used for plain connections and 8883 for TLS ones.
pub fn parse_mqtt_endpoint(addr: &str, default_port: u16, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }
    if remainder.is_empty() {
        return Err(anyhow!("MQTT broker address is empty"));
    }

    let fallback = if use_tls && default_port == DEFAULT_MQTT_PORT {
        DEFAULT_MQTTS_PORT
    } else {
        default_port
    };
    let (host, port) = split_host_port(remainder, fallback)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?,
            None if rest.is_empty() => default_port,
            None => return Err(anyhow!("invalid MQTT address: {}", addr)),
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid MQTT port in {}", addr))?;
            Ok((host.to_string(), port))
        }
        // Bare IPv6 literal without brackets.
        Some(_) => Ok((addr.to_string(), default_port)),
        None => Ok((addr.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_endpoint_plain() {
        let ep = parse_mqtt_endpoint("192.168.10.1:1883", DEFAULT_MQTT_PORT, false).unwrap();
        assert_eq!(ep.host, "192.168.10.1");
        assert_eq!(ep.port, 1883);
        assert!(!ep.use_tls);
    }

    #[test]
    fn bare_host_takes_default_port() {
        let ep = parse_mqtt_endpoint("broker.local", 1884, false).unwrap();
        assert_eq!(ep.port, 1884);
        let ep = parse_mqtt_endpoint("mqtts://broker.local", DEFAULT_MQTT_PORT, false).unwrap();
        assert_eq!(ep.port, 8883);
        assert!(ep.use_tls);
    }

    #[test]
    fn parse_endpoint_mqtts_scheme() {
        let ep = parse_mqtt_endpoint("mqtts://broker.example.com:8884", 1883, false).unwrap();
        assert_eq!(ep.host, "broker.example.com");
        assert_eq!(ep.port, 8884);
        assert!(ep.use_tls);
        assert_eq!(ep.to_string(), "mqtts://broker.example.com:8884");
    }

    #[test]
    fn parse_endpoint_ipv6() {
        let ep = parse_mqtt_endpoint("[::1]:1883", 1883, false).unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 1883);
        let ep = parse_mqtt_endpoint("[::1]", 1890, false).unwrap();
        assert_eq!(ep.port, 1890);
    }

    #[test]
    fn rejects_unknown_scheme_and_bad_port() {
        assert!(parse_mqtt_endpoint("http://broker:80", 1883, false).is_err());
        assert!(parse_mqtt_endpoint("broker:notaport", 1883, false).is_err());
        assert!(parse_mqtt_endpoint("  ", 1883, false).is_err());
    }

    #[test]
    fn tls_materials_requires_both_cert_and_key() {
        let cert_only = TlsMaterials::load(None, Some(Path::new("/nonexistent/cert.pem")), None);
        assert!(cert_only.is_err());
        assert!(cert_only.unwrap_err().to_string().contains("without key"));
    }

    #[test]
    fn plain_endpoint_refuses_tls_materials() {
        let ep = parse_mqtt_endpoint("broker:1883", 1883, false).unwrap();
        let materials = TlsMaterials {
            ca: Some(b"-----BEGIN CERTIFICATE-----".to_vec()),
            client_auth: None,
        };
        assert!(ep.build_transport(&materials).is_err());
        assert!(ep.build_transport(&TlsMaterials::default()).is_ok());
    }
}
