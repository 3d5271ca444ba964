//! DeviceCheck two-bit client.
//!
//! Apple keeps two bits of state per device, readable and writable by the
//! developer. Requests are authenticated with an ES256 JWT signed by a
//! DeviceCheck key from the developer portal.
//!
//! ```no_run
//! use devicecheck::{bits::BitsClient, Environment};
//!
//! # async fn example(device_token: &str) -> Result<(), devicecheck::bits::BitsError> {
//! let client = BitsClient::new(
//!     "TEAMID",
//!     "KEYID",
//!     &std::fs::read_to_string("AuthKey_KEYID.p8").unwrap_or_default(),
//!     Environment::Development,
//! )?;
//!
//! let state = client.query_bits(device_token, None).await?;
//! if state.bit0 != Some(true) {
//!     client.update_bits(device_token, Some(true), None, None).await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use openssl::pkey::{Id, PKey};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::config::Environment;

pub const PRODUCTION_URL: &str = "https://api.devicecheck.apple.com/v1";
pub const DEVELOPMENT_URL: &str = "https://api.development.devicecheck.apple.com/v1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_LIFETIME_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum BitsError {
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Failed to sign authentication token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: Check your authentication credentials")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not Found: Invalid endpoint or resource")]
    NotFound,

    #[error("Rate Limited: Too many requests")]
    RateLimited,

    #[error("Request failed ({status}): {message}")]
    RequestFailed { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    InvalidResponse(String),
}

/// Current bit state of a device. Fields are absent when Apple has no state
/// for the device yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BitsState {
    #[serde(default)]
    pub bit0: Option<bool>,
    #[serde(default)]
    pub bit1: Option<bool>,
    /// `YYYY-MM` of the last update.
    #[serde(default)]
    pub last_update_time: Option<String>,
}

#[derive(Debug, Serialize)]
struct BitsRequest<'a> {
    device_token: &'a str,
    transaction_id: String,
    timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    bit0: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bit1: Option<bool>,
}

impl<'a> BitsRequest<'a> {
    fn new(device_token: &'a str, transaction_id: Option<&str>) -> Self {
        Self {
            device_token,
            transaction_id: transaction_id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            timestamp: u64::try_from(now().as_millis()).unwrap_or(u64::MAX),
            bit0: None,
            bit1: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Accepts a PEM (PKCS#8 or SEC1) or a base64 encoded PEM, and returns the
/// key as a PKCS#8 PEM.
fn normalize_private_key(private_key: &str) -> Result<Vec<u8>, BitsError> {
    let mut pem = private_key.trim().as_bytes().to_vec();

    if !private_key.contains("BEGIN") && !private_key.contains("END") {
        if let Ok(decoded) = general_purpose::STANDARD.decode(private_key.trim()) {
            if String::from_utf8_lossy(&decoded).contains("BEGIN") {
                pem = decoded;
            }
        }
    }

    let key = PKey::private_key_from_pem(&pem)
        .map_err(|e| BitsError::InvalidPrivateKey(e.to_string()))?;
    if key.id() != Id::EC {
        return Err(BitsError::InvalidPrivateKey("not an EC key".to_string()));
    }

    key.private_key_to_pem_pkcs8()
        .map_err(|e| BitsError::InvalidPrivateKey(e.to_string()))
}

fn error_for_status(status: StatusCode, body: &str) -> BitsError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_string());

    match status.as_u16() {
        400 => BitsError::BadRequest(message),
        401 => BitsError::Unauthorized,
        403 => BitsError::Forbidden(message),
        404 => BitsError::NotFound,
        429 => BitsError::RateLimited,
        status => BitsError::RequestFailed { status, message },
    }
}

/// Client for the DeviceCheck `query_two_bits`, `update_two_bits` and
/// `validate_device_token` endpoints.
pub struct BitsClient {
    team_id: String,
    key_id: String,
    encoding_key: EncodingKey,
    environment: Environment,
    base_url: String,
    http: Client,
}

impl std::fmt::Debug for BitsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitsClient")
            .field("team_id", &self.team_id)
            .field("key_id", &self.key_id)
            .field("environment", &self.environment)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl BitsClient {
    /// * `team_id` - Apple Developer Team ID.
    /// * `key_id` - ID of the DeviceCheck key.
    /// * `private_key` - the key's PEM, or the PEM base64 encoded.
    pub fn new(
        team_id: impl Into<String>,
        key_id: impl Into<String>,
        private_key: &str,
        environment: Environment,
    ) -> Result<Self, BitsError> {
        let pem = normalize_private_key(private_key)?;
        let encoding_key = EncodingKey::from_ec_pem(&pem)
            .map_err(|e| BitsError::InvalidPrivateKey(e.to_string()))?;

        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            team_id: team_id.into(),
            key_id: key_id.into(),
            encoding_key,
            environment,
            base_url: match environment {
                Environment::Production => PRODUCTION_URL,
                Environment::Development => DEVELOPMENT_URL,
            }
            .to_string(),
            http,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// ES256 bearer token, valid for an hour.
    pub fn authentication_token(&self) -> Result<String, BitsError> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());

        let iat = now().as_secs();
        let claims = Claims {
            iss: self.team_id.clone(),
            iat,
            exp: iat + TOKEN_LIFETIME_SECS,
        };

        Ok(encode(&header, &claims, &self.encoding_key)?)
    }

    #[instrument(level = "debug", skip(self, device_token))]
    pub async fn query_bits(
        &self,
        device_token: &str,
        transaction_id: Option<&str>,
    ) -> Result<BitsState, BitsError> {
        let body = self
            .post("/query_two_bits", &BitsRequest::new(device_token, transaction_id))
            .await?;

        if body.trim().is_empty() {
            return Ok(BitsState::default());
        }
        serde_json::from_str(&body).map_err(|e| BitsError::InvalidResponse(e.to_string()))
    }

    /// Sets the given bits; `None` leaves a bit unchanged.
    #[instrument(level = "debug", skip(self, device_token))]
    pub async fn update_bits(
        &self,
        device_token: &str,
        bit0: Option<bool>,
        bit1: Option<bool>,
        transaction_id: Option<&str>,
    ) -> Result<(), BitsError> {
        let mut request = BitsRequest::new(device_token, transaction_id);
        request.bit0 = bit0;
        request.bit1 = bit1;

        self.post("/update_two_bits", &request).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, device_token))]
    pub async fn validate_device_token(
        &self,
        device_token: &str,
        transaction_id: Option<&str>,
    ) -> Result<(), BitsError> {
        self.post(
            "/validate_device_token",
            &BitsRequest::new(device_token, transaction_id),
        )
        .await?;
        Ok(())
    }

    async fn post(&self, endpoint: &str, payload: &BitsRequest<'_>) -> Result<String, BitsError> {
        let url = format!("{}{endpoint}", self.base_url);
        debug!(%url, transaction_id = %payload.transaction_id, "sending DeviceCheck request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(self.authentication_token()?)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            warn!(%status, %url, "DeviceCheck request failed");
            return Err(error_for_status(status, &body));
        }
        Ok(body)
    }
}
