//! OAuth credential set and token state.
//!
//! The token state is a tagged variant replaced as a whole on every
//! transition, so a half-updated credential set cannot be observed.
//!
//! ```text
//! NoToken --authorize--> Authorized --expiry--> Expired --refresh--> Authorized
//!                            |                    |
//!                            +--401--> Rejected --+--invalid_grant--> (reauthorize) --> Authorized
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::unix_now;

/// Static client registration.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Full credential set as loaded from configuration.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Split into the immutable client part and the initial token state.
    pub fn into_parts(self) -> (ClientCredentials, TokenState) {
        let client = ClientCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
        };
        let state = TokenState::from_tokens(self.access_token.clone(), self.refresh_token.clone());
        (client, state)
    }
}

/// Access/refresh token pair returned by the token endpoint.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }

    /// Keep the previous refresh token when the endpoint did not rotate it.
    pub fn or_refresh(mut self, previous: Option<String>) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token = previous;
        }
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TokenState {
    /// Nothing to authenticate with; only a full authorization helps.
    #[default]
    NoToken,
    /// A refresh token survived from configuration, but no access token.
    NoAccessToken { refresh_token: String },
    Authorized(TokenPair),
    /// The access token's own expiry claim says it is stale.
    Expired(TokenPair),
    /// The API answered 401 for this access token.
    Rejected(TokenPair),
}

impl TokenState {
    pub fn from_tokens(access_token: Option<String>, refresh_token: Option<String>) -> Self {
        match (access_token, refresh_token) {
            (Some(access), refresh) if !access.trim().is_empty() => {
                Self::Authorized(TokenPair::new(access, refresh.filter(|r| !r.trim().is_empty())))
            }
            (_, Some(refresh)) if !refresh.trim().is_empty() => {
                Self::NoAccessToken { refresh_token: refresh }
            }
            _ => Self::NoToken,
        }
    }

    /// Re-examine the access token's expiry claim at `now`.
    pub fn observe_expiry(self, now: f64) -> Self {
        match self {
            Self::Authorized(pair) if is_expired_at(&pair.access_token, now) => Self::Expired(pair),
            other => other,
        }
    }

    /// Record a 401 for `access_token`. Ignored when the state has already
    /// moved on to a different token.
    pub fn reject(self, access_token: &str) -> Self {
        match self {
            Self::Authorized(pair) if pair.access_token == access_token => Self::Rejected(pair),
            other => other,
        }
    }

    /// Access token usable for a request right now.
    pub fn access_token(&self) -> Option<&str> {
        match self {
            Self::Authorized(pair) => Some(pair.access_token.as_str()),
            _ => None,
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        match self {
            Self::NoAccessToken { refresh_token } => Some(refresh_token.as_str()),
            Self::Authorized(pair) | Self::Expired(pair) | Self::Rejected(pair) => {
                pair.refresh_token.as_deref()
            }
            Self::NoToken => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoToken => "no-token",
            Self::NoAccessToken { .. } => "no-access-token",
            Self::Authorized(_) => "authorized",
            Self::Expired(_) => "expired",
            Self::Rejected(_) => "rejected",
        }
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Whether `token`'s embedded expiry claim has passed.
///
/// The signature is not verified; the issuer is trusted. Tokens without an
/// `exp` claim, or that do not decode as a JWT, count as expired.
pub fn is_expired(token: &str) -> bool {
    is_expired_at(token, unix_now())
}

pub fn is_expired_at(token: &str, now: f64) -> bool {
    match expiry_claim(token) {
        Some(exp) => now >= exp,
        None => {
            log::debug!("token carries no decodable expiry claim; treating as expired");
            true
        }
    }
}

fn expiry_claim(token: &str) -> Option<f64> {
    let mut segments = token.split('.');
    let (_header, payload) = (segments.next()?, segments.next()?);
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    claims.exp.filter(|exp| exp.is_finite())
}
