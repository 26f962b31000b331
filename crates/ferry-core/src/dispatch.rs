use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::DispatchError;

/// Parameters of a host call, always a JSON object.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// How the host should shape a reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    #[default]
    Json,
    /// Raw bytes, never decoded by the host.
    Binary,
}

/// Options passed alongside a host call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatchOptions {
    pub response_type: ResponseType,
    /// Out-of-band payload attached to the call.
    pub bytes: Option<Bytes>,
    /// Allow the dispatcher to answer from a memoised reply.
    pub cache: bool,
}

impl DispatchOptions {
    pub fn binary() -> Self {
        Self {
            response_type: ResponseType::Binary,
            ..Self::default()
        }
    }

    pub fn with_bytes(mut self, bytes: Option<Bytes>) -> Self {
        self.bytes = bytes;
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }
}

/// Reply body of a successful host call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    Json(serde_json::Value),
    Binary(#[serde(with = "crate::b64")] Bytes),
}

impl Payload {
    /// Raw bytes of the payload. JSON bodies are serialized.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Binary(b) => b,
            Self::Json(v) => Bytes::from(serde_json::to_vec(&v).unwrap_or_default()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// The host-side call dispatcher that the runtime relays into.
#[async_trait]
pub trait HostDispatch: Send + Sync {
    async fn dispatch(
        &self,
        name: &str,
        params: Params,
        options: DispatchOptions,
    ) -> Result<Payload, DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_options_request_raw_bytes() {
        let opts = DispatchOptions::binary();
        assert_eq!(opts.response_type, ResponseType::Binary);
        assert!(!opts.cache);
        assert!(opts.bytes.is_none());
    }

    #[test]
    fn json_payload_into_bytes() {
        let payload = Payload::Json(serde_json::json!({"a": 1}));
        assert_eq!(&payload.into_bytes()[..], br#"{"a":1}"#);
        assert!(Payload::Empty.into_bytes().is_empty());
    }

    #[test]
    fn binary_payload_serializes_as_base64() {
        let payload = Payload::Binary(Bytes::from_static(b"hi"));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "binary");
        assert_eq!(json["value"], "aGk=");

        let back: Payload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
