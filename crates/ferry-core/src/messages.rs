//! Messages that cross the boundary between the host and a background
//! execution context.
//!
//! Contexts never share memory with the host. Every message is moved through
//! a channel; binary payloads travel as owned [`Bytes`] buffers. When a
//! message has to leave the process it is rendered with
//! [`ContextMessage::to_value`], which uses the reserved `__`-prefixed keys:
//!
//! - `{"__argsRequested": true}`
//! - `{"__argsReply": [..]}`
//! - `{"__callRequest": {"message": "ipc://..", "bytes": "<base64>"}}`
//! - `{"__callResult": {"message": <envelope>, "result": <outcome>}}`
//! - `{"__runtimeEvent": {"type": "data", "detail": {..}}}`
//!
//! Anything else is an opaque passthrough payload.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::{Params, Payload};
use crate::envelope::CallEnvelope;
use crate::errors::DispatchError;
use crate::events::{BroadcastEvent, EventKind};

const ARGS_REQUESTED: &str = "__argsRequested";
const ARGS_REPLY: &str = "__argsReply";
const CALL_REQUEST: &str = "__callRequest";
const CALL_RESULT: &str = "__callResult";
const RUNTIME_EVENT: &str = "__runtimeEvent";

/// A call raised inside a context, not yet parsed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallRequest {
    pub message: Option<String>,
    pub bytes: Option<Bytes>,
}

impl CallRequest {
    pub fn new(message: impl Into<String>, bytes: Option<Bytes>) -> Self {
        Self {
            message: Some(message.into()),
            bytes,
        }
    }

    /// The call string, if it carries the call scheme.
    pub fn relayable(&self) -> Option<&str> {
        self.message
            .as_deref()
            .filter(|m| CallEnvelope::is_call(m))
    }
}

/// Serialized result of a relayed call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<DispatchError>,
}

impl CallOutcome {
    pub fn from_result(source: impl Into<String>, result: Result<Payload, DispatchError>) -> Self {
        let source = source.into();
        match result {
            Ok(data) => Self {
                source,
                data: Some(data),
                err: None,
            },
            Err(err) => Self {
                source,
                data: None,
                err: Some(err),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }
}

/// A broadcast re-posted into a context with its own copy of the payload.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardedEvent {
    pub kind: EventKind,
    pub detail: Params,
    pub data: Bytes,
}

impl ForwardedEvent {
    /// Copy the event's payload into a fresh buffer owned by the message.
    pub fn from_broadcast(event: &BroadcastEvent) -> Self {
        let data = event
            .detail
            .data
            .as_deref()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        Self {
            kind: event.kind,
            detail: event.detail.fields.clone(),
            data,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ContextMessage {
    ArgsRequested,
    ArgsReply(Vec<String>),
    CallRequest(CallRequest),
    CallResult {
        message: CallEnvelope,
        result: CallOutcome,
    },
    Event(ForwardedEvent),
    Passthrough(Value),
}

impl ContextMessage {
    pub fn to_value(&self) -> Value {
        match self {
            Self::ArgsRequested => serde_json::json!({ ARGS_REQUESTED: true }),
            Self::ArgsReply(args) => serde_json::json!({ ARGS_REPLY: args }),
            Self::CallRequest(req) => {
                let mut body = serde_json::Map::new();
                body.insert(
                    "message".into(),
                    req.message.clone().map(Value::String).unwrap_or(Value::Null),
                );
                if let Some(bytes) = &req.bytes {
                    body.insert("bytes".into(), Value::String(STANDARD.encode(bytes)));
                }
                serde_json::json!({ CALL_REQUEST: body })
            }
            Self::CallResult { message, result } => serde_json::json!({
                CALL_RESULT: {
                    "message": message,
                    "result": result,
                }
            }),
            Self::Event(event) => {
                let mut detail = event.detail.clone();
                detail.insert("data".into(), Value::String(STANDARD.encode(&event.data)));
                serde_json::json!({
                    RUNTIME_EVENT: {
                        "type": event.kind,
                        "detail": detail,
                    }
                })
            }
            Self::Passthrough(value) => value.clone(),
        }
    }

    /// Classify a wire value. Unrecognised or malformed shapes become
    /// [`ContextMessage::Passthrough`].
    pub fn from_value(value: Value) -> Self {
        match value.as_object().and_then(Self::classify) {
            Some(message) => message,
            None => Self::Passthrough(value),
        }
    }

    fn classify(obj: &serde_json::Map<String, Value>) -> Option<Self> {
        if obj.get(ARGS_REQUESTED).is_some_and(is_truthy) {
            return Some(Self::ArgsRequested);
        }
        if let Some(args) = obj.get(ARGS_REPLY) {
            if let Ok(args) = serde_json::from_value::<Vec<String>>(args.clone()) {
                return Some(Self::ArgsReply(args));
            }
        }
        if let Some(req) = obj.get(CALL_REQUEST).filter(|r| r.is_object()) {
            let message = req
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let bytes = req
                .get("bytes")
                .and_then(Value::as_str)
                .and_then(|b| STANDARD.decode(b).ok())
                .map(Bytes::from);
            return Some(Self::CallRequest(CallRequest { message, bytes }));
        }
        if let Some(result) = obj.get(CALL_RESULT) {
            #[derive(Deserialize)]
            struct Wire {
                message: CallEnvelope,
                result: CallOutcome,
            }
            if let Ok(wire) = serde_json::from_value::<Wire>(result.clone()) {
                return Some(Self::CallResult {
                    message: wire.message,
                    result: wire.result,
                });
            }
        }
        if let Some(event) = obj.get(RUNTIME_EVENT) {
            let kind = event
                .get("type")
                .and_then(|t| serde_json::from_value::<EventKind>(t.clone()).ok());
            let detail = event.get("detail").and_then(Value::as_object);
            if let (Some(kind), Some(detail)) = (kind, detail) {
                let mut detail = detail.clone();
                let data = detail
                    .remove("data")
                    .as_ref()
                    .and_then(Value::as_str)
                    .and_then(|b| STANDARD.decode(b).ok())
                    .map(Bytes::from)
                    .unwrap_or_default();
                return Some(Self::Event(ForwardedEvent { kind, detail, data }));
            }
        }

        None
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ArgsRequested => "args_requested",
            Self::ArgsReply(_) => "args_reply",
            Self::CallRequest(_) => "call_request",
            Self::CallResult { .. } => "call_result",
            Self::Event(_) => "event",
            Self::Passthrough(_) => "passthrough",
        }
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::CallId;
    use std::collections::BTreeMap;

    #[test]
    fn args_requested_wire_shape() {
        let value = ContextMessage::ArgsRequested.to_value();
        assert_eq!(value, serde_json::json!({"__argsRequested": true}));
        assert_eq!(ContextMessage::from_value(value), ContextMessage::ArgsRequested);
    }

    #[test]
    fn falsy_args_flag_is_passthrough() {
        let value = serde_json::json!({"__argsRequested": false});
        assert!(matches!(
            ContextMessage::from_value(value),
            ContextMessage::Passthrough(_)
        ));
    }

    #[test]
    fn call_request_decodes_bytes() {
        let value = serde_json::json!({
            "__callRequest": {"message": "ipc://x?a=1", "bytes": "AQID"}
        });
        let ContextMessage::CallRequest(req) = ContextMessage::from_value(value) else {
            panic!("expected call request");
        };
        assert_eq!(req.relayable(), Some("ipc://x?a=1"));
        assert_eq!(req.bytes.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn non_string_call_message_is_not_relayable() {
        let value = serde_json::json!({"__callRequest": {"message": 12}});
        let ContextMessage::CallRequest(req) = ContextMessage::from_value(value) else {
            panic!("expected call request");
        };
        assert!(req.relayable().is_none());
        assert!(CallRequest::new("hello", None).relayable().is_none());
    }

    #[test]
    fn call_result_survives_wire() {
        let msg = ContextMessage::CallResult {
            message: CallEnvelope::new("x").with_param("a", "1"),
            result: CallOutcome::from_result("x", Ok(Payload::Json(serde_json::json!({"ok": true})))),
        };
        assert_eq!(ContextMessage::from_value(msg.to_value()), msg);
    }

    #[test]
    fn failed_outcome_carries_err() {
        let outcome = CallOutcome::from_result("x", Err(DispatchError::MethodNotFound("x".into())));
        assert!(!outcome.is_ok());
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["err"]["code"], "METHOD_NOT_FOUND");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn forwarded_event_copies_payload() {
        let original = Bytes::from(vec![9u8, 8, 7]);
        let event = BroadcastEvent::data(
            &CallId::from_raw("1"),
            &BTreeMap::new(),
            Params::new(),
            original.clone(),
        );
        let forwarded = ForwardedEvent::from_broadcast(&event);
        assert_eq!(forwarded.data, original);
        assert_ne!(forwarded.data.as_ptr(), original.as_ptr());

        let msg = ContextMessage::Event(forwarded);
        let value = msg.to_value();
        assert_eq!(value["__runtimeEvent"]["type"], "data");
        assert_eq!(value["__runtimeEvent"]["detail"]["id"], "1");
        assert_eq!(ContextMessage::from_value(value), msg);
    }

    #[test]
    fn event_without_payload_forwards_empty_buffer() {
        let forwarded = ForwardedEvent::from_broadcast(&BroadcastEvent::init());
        assert!(forwarded.data.is_empty());
    }

    #[test]
    fn unknown_shapes_pass_through() {
        let value = serde_json::json!({"hello": "world"});
        assert_eq!(
            ContextMessage::from_value(value.clone()),
            ContextMessage::Passthrough(value)
        );
        assert_eq!(
            ContextMessage::from_value(serde_json::json!("text")).kind(),
            "passthrough"
        );
    }
}
