//! Request context and response envelope

use crate::commands::Verb;
use crate::status::{AlpacaError, AlpacaResult, AscomStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Decoded `key=value` parameters from a form body or query string.
///
/// Keys keep their original spelling but are looked up case-insensitively.
/// Pairs with an empty key are dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormParams {
    pairs: Vec<(String, String)>,
}

impl FormParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if !key.is_empty() {
            self.pairs.push((key, value.into()));
        }
    }

    /// First value whose key matches exactly, ignoring case.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Required string argument
    #[track_caller]
    pub fn required(&self, component: &str, key: &str) -> AlpacaResult<&str> {
        match self.get(key) {
            Some(value) => Ok(value),
            None => Err(AlpacaError::missing_keyword(component, key)),
        }
    }

    /// Required integer argument. Decimal fractions are truncated.
    #[track_caller]
    pub fn required_i32(&self, component: &str, key: &str) -> AlpacaResult<i32> {
        let raw = self.required(component, key)?;
        match parse_number(raw) {
            Some(value) => Ok(value as i32),
            None => Err(not_valid(component, raw, key)),
        }
    }

    /// Required floating point argument; a decimal comma is accepted.
    #[track_caller]
    pub fn required_f64(&self, component: &str, key: &str) -> AlpacaResult<f64> {
        let raw = self.required(component, key)?;
        match parse_number(raw) {
            Some(value) => Ok(value),
            None => Err(not_valid(component, raw, key)),
        }
    }

    /// Required boolean argument: `true`/`false` in any case.
    #[track_caller]
    pub fn required_bool(&self, component: &str, key: &str) -> AlpacaResult<bool> {
        let raw = self.required(component, key)?;
        match parse_bool(raw) {
            Some(value) => Ok(value),
            None => Err(not_valid(component, raw, key)),
        }
    }
}

impl Extend<(String, String)> for FormParams {
    fn extend<I: IntoIterator<Item = (String, String)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl FromIterator<(String, String)> for FormParams {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut params = Self::new();
        params.extend(iter);
        params
    }
}

#[track_caller]
fn not_valid(component: &str, raw: &str, key: &str) -> AlpacaError {
    AlpacaError::invalid_value(component, format!("'{}' is not a valid {}", raw, key))
}

fn parse_number(raw: &str) -> Option<f64> {
    let value: f64 = raw.trim().replace(',', ".").parse().ok()?;
    value.is_finite().then_some(value)
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// One inbound call, discarded once the envelope is built
#[derive(Debug, Clone)]
pub struct AlpacaRequest {
    pub device_type: String,
    pub device_number: String,
    pub command: String,
    pub verb: Verb,
    pub params: FormParams,
}

impl AlpacaRequest {
    pub fn new(
        device_type: impl Into<String>,
        device_number: impl ToString,
        command: impl Into<String>,
        verb: Verb,
    ) -> Self {
        Self {
            device_type: device_type.into(),
            device_number: device_number.to_string(),
            command: command.into(),
            verb,
            params: FormParams::new(),
        }
    }

    pub fn get(device_type: impl Into<String>, device_number: u32, command: impl Into<String>) -> Self {
        Self::new(device_type, device_number, command, Verb::Get)
    }

    pub fn put(device_type: impl Into<String>, device_number: u32, command: impl Into<String>) -> Self {
        Self::new(device_type, device_number, command, Verb::Put)
    }

    pub fn with_params(mut self, params: FormParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Echoed back; anything unparsable or negative reads as 0.
    pub fn client_transaction_id(&self) -> u32 {
        self.params
            .get("ClientTransactionID")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn client_id(&self) -> u32 {
        self.params
            .get("ClientID")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Typed fields a handler writes on success
#[derive(Debug, Clone, Default)]
pub struct ResponseFields {
    fields: Map<String, Value>,
}

impl ResponseFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the standard `Value` field
    pub fn value(&mut self, value: impl Into<Value>) {
        self.fields.insert("Value".to_string(), value.into());
    }

    /// Add a named field, as `readall` and `temperature` do
    pub fn field(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }
}

/// The JSON object sent back for every request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct AlpacaResponse {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(rename = "ClientTransactionID", default)]
    pub client_transaction_id: u32,
    #[serde(rename = "ServerTransactionID", default)]
    pub server_transaction_id: u32,
    pub error_number: i32,
    #[serde(default)]
    pub error_message: String,
}

impl AlpacaResponse {
    pub fn success(fields: ResponseFields, client_transaction_id: u32, server_transaction_id: u32) -> Self {
        Self {
            fields: fields.into_map(),
            client_transaction_id,
            server_transaction_id,
            error_number: AscomStatus::Success.code(),
            error_message: String::new(),
        }
    }

    pub fn failure(error: &AlpacaError, client_transaction_id: u32, server_transaction_id: u32) -> Self {
        Self {
            fields: Map::new(),
            client_transaction_id,
            server_transaction_id,
            error_number: error.code(),
            error_message: error.message.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_number == 0
    }

    pub fn status(&self) -> Option<AscomStatus> {
        AscomStatus::from_code(self.error_number)
    }

    pub fn value(&self) -> Option<&Value> {
        self.fields.get("Value")
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}
