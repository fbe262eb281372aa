//! Alpaca HTTP Client
//!
//! Typed access to a remote Alpaca device. Used by front ends and by the
//! network discovery helpers; the host itself never calls it.

use crate::request::AlpacaResponse;
use crate::status::AscomStatus;
use crate::{AlpacaDeviceType, ALPACA_API_VERSION};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Client ID for Alpaca API calls (thread-safe)
static CLIENT_ID: AtomicU32 = AtomicU32::new(1);
static TRANSACTION_ID: AtomicU32 = AtomicU32::new(0);

/// Envelope keys stripped from `readall` results
const ENVELOPE_KEYS: [&str; 4] = [
    "ClientTransactionID",
    "ServerTransactionID",
    "ErrorNumber",
    "ErrorMessage",
];

/// Client-side failures
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection timeout after {duration_ms}ms during {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("Connection refused: {url} - {cause}")]
    ConnectionRefused { url: String, cause: String },

    #[error("HTTP error {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("Device error {code}: {message}")]
    DeviceError { code: i32, message: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),
}

impl ClientError {
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        ClientError::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// ASCOM status carried by a device error
    pub fn status(&self) -> Option<AscomStatus> {
        match self {
            ClientError::DeviceError { code, .. } => AscomStatus::from_code(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::timeout("HTTP request", 0)
        } else if err.is_connect() {
            let url = err
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionRefused {
                url,
                cause: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            ClientError::HttpError {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ClientError::RequestFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::ParseError(err.to_string())
    }
}

/// Next `(ClientID, ClientTransactionID)` pair
pub fn next_client_transaction() -> (u32, u32) {
    let client_id = CLIENT_ID.load(Ordering::SeqCst);
    let transaction_id = TRANSACTION_ID.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
    (client_id, transaction_id)
}

pub fn set_client_id(id: u32) {
    CLIENT_ID.store(id, Ordering::SeqCst);
}

/// Turn a decoded envelope into its fields, or the device error it reports.
pub fn check_envelope(response: AlpacaResponse) -> Result<Map<String, Value>, ClientError> {
    if response.error_number != 0 {
        return Err(ClientError::DeviceError {
            code: response.error_number,
            message: response.error_message,
        });
    }
    Ok(response.fields)
}

fn take_value<T: DeserializeOwned>(mut fields: Map<String, Value>) -> Result<T, ClientError> {
    match fields.remove("Value") {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Err(ClientError::ParseError("response carries no Value".to_string())),
    }
}

/// Alpaca client for communicating with a device
#[derive(Debug, Clone)]
pub struct AlpacaClient {
    http_client: Client,
    base_url: String,
    device_type: AlpacaDeviceType,
    device_number: u32,
    timeout: Duration,
}

impl AlpacaClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(
        base_url: impl Into<String>,
        device_type: AlpacaDeviceType,
        device_number: u32,
    ) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, device_type, device_number, Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        device_type: AlpacaDeviceType,
        device_number: u32,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::RequestFailed(e.to_string()))?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            device_type,
            device_number,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn device_type(&self) -> AlpacaDeviceType {
        self.device_type
    }

    pub fn device_number(&self) -> u32 {
        self.device_number
    }

    /// Build the URL for an API endpoint
    pub fn build_url(&self, command: &str) -> String {
        format!(
            "{}/api/v{}/{}/{}/{}",
            self.base_url,
            ALPACA_API_VERSION,
            self.device_type.as_str(),
            self.device_number,
            command
        )
    }

    fn map_send_error(&self, command: &str, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::timeout(command, self.timeout.as_millis() as u64)
        } else {
            err.into()
        }
    }

    async fn decode(response: reqwest::Response) -> Result<Map<String, Value>, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::HttpError {
                status: status.as_u16(),
                message: body,
            });
        }
        let envelope: AlpacaResponse = response.json().await?;
        check_envelope(envelope)
    }

    /// GET a command and return every non-envelope field
    pub async fn get_fields(&self, command: &str) -> Result<Map<String, Value>, ClientError> {
        let (client_id, transaction_id) = next_client_transaction();
        let url = self.build_url(command);
        debug!(%url, transaction_id, "Alpaca GET");
        let response = self
            .http_client
            .get(&url)
            .query(&[("ClientID", client_id), ("ClientTransactionID", transaction_id)])
            .send()
            .await
            .map_err(|e| self.map_send_error(command, e))?;
        Self::decode(response).await
    }

    pub async fn get<T: DeserializeOwned>(&self, command: &str) -> Result<T, ClientError> {
        take_value(self.get_fields(command).await?)
    }

    pub async fn get_bool(&self, command: &str) -> Result<bool, ClientError> {
        self.get(command).await
    }

    pub async fn get_i32(&self, command: &str) -> Result<i32, ClientError> {
        self.get(command).await
    }

    pub async fn get_f64(&self, command: &str) -> Result<f64, ClientError> {
        self.get(command).await
    }

    pub async fn get_string(&self, command: &str) -> Result<String, ClientError> {
        self.get(command).await
    }

    /// PUT a command with form parameters
    pub async fn put(&self, command: &str, params: &[(&str, &str)]) -> Result<Map<String, Value>, ClientError> {
        let (client_id, transaction_id) = next_client_transaction();
        let url = self.build_url(command);
        let client_id = client_id.to_string();
        let transaction_id = transaction_id.to_string();

        let mut form: Vec<(&str, &str)> = vec![
            ("ClientID", client_id.as_str()),
            ("ClientTransactionID", transaction_id.as_str()),
        ];
        form.extend_from_slice(params);

        debug!(%url, "Alpaca PUT");
        let response = self
            .http_client
            .put(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| self.map_send_error(command, e))?;
        Self::decode(response).await
    }

    pub async fn connected(&self) -> Result<bool, ClientError> {
        self.get_bool("connected").await
    }

    pub async fn set_connected(&self, connected: bool) -> Result<(), ClientError> {
        let value = if connected { "true" } else { "false" };
        self.put("connected", &[("Connected", value)]).await.map(|_| ())
    }

    pub async fn supported_actions(&self) -> Result<Vec<String>, ClientError> {
        self.get("supportedactions").await
    }

    /// Every property in one round trip
    pub async fn read_all(&self) -> Result<Map<String, Value>, ClientError> {
        let mut fields = self.get_fields("readall").await?;
        for key in ENVELOPE_KEYS {
            fields.remove(key);
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::AlpacaError;
    use std::collections::HashSet;

    #[test]
    fn test_transaction_ids_are_unique() {
        let ids: HashSet<u32> = (0..100).map(|_| next_client_transaction().1).collect();
        assert_eq!(ids.len(), 100);
        assert!(!ids.contains(&0));
    }

    #[test]
    fn test_build_url() {
        let client = AlpacaClient::new("http://localhost:6800/", AlpacaDeviceType::Focuser, 0).unwrap();
        assert_eq!(client.build_url("position"), "http://localhost:6800/api/v1/focuser/0/position");
    }

    #[test]
    fn test_device_error_from_envelope() {
        let error = AlpacaError::invalid_value("Focuser", "out of range");
        let envelope = AlpacaResponse::failure(&error, 1, 2);
        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: AlpacaResponse = serde_json::from_str(&json).unwrap();

        let err = check_envelope(decoded).unwrap_err();
        assert_eq!(err.status(), Some(AscomStatus::InvalidValue));
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_sparse_envelope_decodes() {
        let decoded: AlpacaResponse =
            serde_json::from_str(r#"{"Value":12.5,"ErrorNumber":0}"#).unwrap();
        let fields = check_envelope(decoded).unwrap();
        let value: f64 = take_value(fields).unwrap();
        assert_eq!(value, 12.5);
    }

    #[test]
    fn test_missing_value_is_parse_error() {
        let err = take_value::<bool>(Map::new()).unwrap_err();
        assert!(matches!(err, ClientError::ParseError(_)));
        let err: ClientError = serde_json::from_str::<bool>("nope").unwrap_err().into();
        assert!(matches!(err, ClientError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let client = AlpacaClient::with_timeout(
            "http://127.0.0.1:9",
            AlpacaDeviceType::Focuser,
            0,
            Duration::from_millis(500),
        )
        .unwrap();
        let err = client.get_i32("position").await.unwrap_err();
        assert!(err.status().is_none());
    }
}
