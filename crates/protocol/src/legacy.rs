//! Frames of the line-oriented method-call protocol.
//!
//! Each request line holds a `{"Method", "Token"}` header immediately
//! followed by the JSON payload, e.g.
//! `{"Method":"ping","Token":"t1"}\t{"Msg":"hi"}`.

use crate::error::{CodecError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const HELLO_TOKEN: &str = "margo.hello";
pub const BYE_TOKEN: &str = "margo.bye-ni";
pub const BYE_METHOD: &str = "bye-ni";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyRequest {
    #[serde(rename = "Method", default)]
    pub method: String,
    #[serde(rename = "Token", default)]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyResponse {
    pub token: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl LegacyResponse {
    pub fn new(token: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            error: String::new(),
            tag: tag.into(),
            data: empty_object(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = if data.is_null() { empty_object() } else { data };
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    /// One line of compact JSON, newline-terminated.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Splits a request line into its header and payload.
///
/// A missing payload decodes as `null`.
pub fn parse_line(line: &str) -> Result<(LegacyRequest, Value)> {
    let mut stream = serde_json::Deserializer::from_str(line).into_iter::<Value>();
    let header = match stream.next() {
        Some(v) => v?,
        None => return Err(CodecError::Other("empty request line".to_string())),
    };
    let req: LegacyRequest = serde_json::from_value(header)?;
    let payload = match stream.next() {
        Some(v) => v?,
        None => Value::Null,
    };
    Ok((req, payload))
}
