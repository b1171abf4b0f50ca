//! Netatmo weather-station API.
//!
//! `StationApi` is the seam between the token lifecycle and HTTP. `NetatmoApi`
//! implements it with blocking `ureq` calls against the public endpoints:
//! - `GET  /oauth2/authorize` (URL only; the user opens it in a browser)
//! - `POST /oauth2/token` (authorization_code and refresh_token grants)
//! - `GET  /api/getstationsdata` (bearer token)

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use super::token::{ClientCredentials, TokenPair};
use super::Observation;

pub const DEFAULT_API_BASE: &str = "https://api.netatmo.com";
const SCOPE: &str = "read_station";

/// Failure talking to the station API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 401 on a data request: the access token is no longer accepted.
    #[error("access token rejected by the station API")]
    Unauthorized,

    /// The token endpoint refused the grant (revoked or expired refresh token,
    /// reused authorization code).
    #[error("grant rejected: {0}")]
    InvalidGrant(String),

    #[error("unexpected HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// HTTP operations the observation reader needs.
pub trait StationApi: Send + Sync {
    /// URL the user visits to grant access. `state` is echoed back by the redirect.
    fn authorize_url(&self, client: &ClientCredentials, state: &str) -> Result<String, ApiError>;

    fn exchange_code(&self, client: &ClientCredentials, code: &str) -> Result<TokenPair, ApiError>;

    fn refresh(&self, client: &ClientCredentials, refresh_token: &str)
        -> Result<TokenPair, ApiError>;

    fn stations_data(&self, access_token: &str) -> Result<StationsBody, ApiError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct StationsResponse {
    body: StationsBody,
}

/// Body of a `getstationsdata` response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StationsBody {
    #[serde(default)]
    pub devices: Vec<StationDevice>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StationDevice {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(default)]
    pub station_name: Option<String>,
    #[serde(default)]
    pub dashboard_data: Option<DashboardData>,
    #[serde(default)]
    pub modules: Vec<StationModule>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StationModule {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(default)]
    pub module_name: Option<String>,
    #[serde(default)]
    pub dashboard_data: Option<DashboardData>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DashboardData {
    #[serde(rename = "Temperature")]
    pub temperature: Option<f64>,
    #[serde(rename = "Humidity")]
    pub humidity: Option<f64>,
    #[serde(rename = "Pressure")]
    pub pressure: Option<f64>,
}

impl StationsBody {
    /// Pick the reading for `sensor_id`.
    ///
    /// The id may name a station (main module) or one of its modules. Module
    /// readings supply temperature and humidity; pressure always comes from the
    /// station, since only the main module has a barometer. Without an id the
    /// first station is used.
    pub fn observation(&self, sensor_id: Option<&str>) -> Result<Observation, String> {
        let (device, module) = match sensor_id.filter(|id| !id.trim().is_empty()) {
            None => (self.devices.first().ok_or("no devices in response")?, None),
            Some(id) => self
                .devices
                .iter()
                .find_map(|device| {
                    if device.id == id {
                        Some((device, None))
                    } else {
                        device
                            .modules
                            .iter()
                            .find(|module| module.id == id)
                            .map(|module| (device, Some(module)))
                    }
                })
                .ok_or_else(|| format!("sensor {} not found in response", id))?,
        };

        let station = device
            .dashboard_data
            .as_ref()
            .ok_or_else(|| format!("station {} has no dashboard data", device.id))?;
        let climate = match module {
            Some(module) => module
                .dashboard_data
                .as_ref()
                .ok_or_else(|| format!("module {} has no dashboard data", module.id))?,
            None => station,
        };

        Ok(Observation {
            temperature: climate.temperature.ok_or("reading has no Temperature")?,
            humidity: climate.humidity.ok_or("reading has no Humidity")?,
            pressure: station.pressure.ok_or("station has no Pressure")?,
        })
    }
}

/// Blocking HTTP client for the Netatmo API.
#[derive(Clone, Debug)]
pub struct NetatmoApi {
    base_url: String,
    agent: ureq::Agent,
}

impl NetatmoApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(std::time::Duration::from_secs(15))
            .build();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenPair, ApiError> {
        match self.agent.post(&self.endpoint("/oauth2/token")).send_form(form) {
            Ok(response) => {
                let body: TokenResponse = response
                    .into_json()
                    .map_err(|e| ApiError::Malformed(e.to_string()))?;
                if let Some(expires_in) = body.expires_in {
                    log::debug!("token endpoint issued access token valid for {}s", expires_in);
                }
                Ok(TokenPair::new(body.access_token, body.refresh_token))
            }
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(classify_token_error(status, body))
            }
            Err(e) => Err(ApiError::Transport(e.to_string())),
        }
    }
}

impl Default for NetatmoApi {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE)
    }
}

impl StationApi for NetatmoApi {
    fn authorize_url(&self, client: &ClientCredentials, state: &str) -> Result<String, ApiError> {
        let url = Url::parse_with_params(
            &self.endpoint("/oauth2/authorize"),
            &[
                ("client_id", client.client_id.as_str()),
                ("redirect_uri", client.redirect_uri.as_str()),
                ("scope", SCOPE),
                ("state", state),
                ("response_type", "code"),
            ],
        )
        .map_err(|e| ApiError::Malformed(format!("authorize url: {}", e)))?;
        Ok(url.into())
    }

    fn exchange_code(&self, client: &ClientCredentials, code: &str) -> Result<TokenPair, ApiError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", client.redirect_uri.as_str()),
            ("scope", SCOPE),
        ])
    }

    fn refresh(
        &self,
        client: &ClientCredentials,
        refresh_token: &str,
    ) -> Result<TokenPair, ApiError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ])
    }

    fn stations_data(&self, access_token: &str) -> Result<StationsBody, ApiError> {
        let result = self
            .agent
            .get(&self.endpoint("/api/getstationsdata"))
            .set("Authorization", &format!("Bearer {}", access_token))
            .call();
        match result {
            Ok(response) => response
                .into_json::<StationsResponse>()
                .map(|r| r.body)
                .map_err(|e| ApiError::Malformed(e.to_string())),
            Err(ureq::Error::Status(401, _)) => Err(ApiError::Unauthorized),
            Err(ureq::Error::Status(status, response)) => Err(ApiError::Status {
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(e) => Err(ApiError::Transport(e.to_string())),
        }
    }
}

/// Map a token-endpoint failure to `ApiError`, recognising `invalid_grant`.
pub fn classify_token_error(status: u16, body: String) -> ApiError {
    let code = serde_json::from_str::<OAuthErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or_default();
    if code.contains("invalid_grant") {
        ApiError::InvalidGrant(body)
    } else {
        ApiError::Status { status, body }
    }
}
