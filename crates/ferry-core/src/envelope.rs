use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::dispatch::Params;
use crate::errors::EnvelopeError;

/// One inter-process call, parsed from an `ipc://name?params` string.
///
/// Parameter values are kept as the raw strings found in the query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub name: String,
    pub params: Params,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::b64::option"
    )]
    pub bytes: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl CallEnvelope {
    pub const SCHEME: &'static str = "ipc://";

    /// Whether a context message string is a relayable call.
    pub fn is_call(message: &str) -> bool {
        message.starts_with(Self::SCHEME)
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Params::new(),
            bytes: None,
            id: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    pub fn with_bytes(mut self, bytes: Option<Bytes>) -> Self {
        self.bytes = bytes;
        self
    }

    pub fn parse(message: &str, bytes: Option<Bytes>) -> Result<Self, EnvelopeError> {
        let rest = message
            .strip_prefix(Self::SCHEME)
            .ok_or(EnvelopeError::MissingScheme {
                expected: Self::SCHEME,
            })?;

        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let name = name.trim_end_matches('/');
        if name.is_empty() {
            return Err(EnvelopeError::EmptyName);
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(EnvelopeError::InvalidName(c));
        }

        let mut params = Params::new();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            params.insert(key.into_owned(), serde_json::Value::String(value.into_owned()));
        }
        let id = params.get("id").and_then(|v| v.as_str()).map(str::to_owned);

        Ok(Self {
            name: name.to_owned(),
            params,
            bytes,
            id,
        })
    }

    /// Render back to the `ipc://` string form.
    pub fn to_uri(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.params {
            match value {
                serde_json::Value::String(s) => query.append_pair(key, s),
                other => query.append_pair(key, &other.to_string()),
            };
        }
        let query = query.finish();
        if query.is_empty() {
            format!("{}{}", Self::SCHEME, self.name)
        } else {
            format!("{}{}?{}", Self::SCHEME, self.name, query)
        }
    }
}
