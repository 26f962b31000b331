use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::dispatch::Params;
use crate::errors::DispatchError;
use crate::ids::CallId;

/// Kinds of process-wide broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Data,
    Error,
    Init,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Error => "error",
            Self::Init => "init",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event detail: JSON fields plus an optional binary payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventDetail {
    pub fields: Params,
    pub data: Option<Bytes>,
}

/// A single event on the broadcast bus.
#[derive(Clone, Debug, PartialEq)]
pub struct BroadcastEvent {
    pub kind: EventKind,
    pub detail: EventDetail,
}

impl BroadcastEvent {
    pub fn new(kind: EventKind, detail: EventDetail) -> Self {
        Self { kind, detail }
    }

    /// A completed post operation: `{headers, params, data, id}`.
    pub fn data(
        id: &CallId,
        headers: &BTreeMap<String, String>,
        params: Params,
        data: Bytes,
    ) -> Self {
        let mut fields = Params::new();
        fields.insert(
            "headers".into(),
            serde_json::to_value(headers).unwrap_or_default(),
        );
        fields.insert("params".into(), serde_json::Value::Object(params));
        fields.insert("id".into(), serde_json::Value::String(id.to_string()));
        Self::new(
            EventKind::Data,
            EventDetail {
                fields,
                data: Some(data),
            },
        )
    }

    /// A failed post operation carrying the dispatcher's error detail.
    pub fn error(id: &CallId, err: &DispatchError) -> Self {
        let mut fields = Params::new();
        fields.insert("error".into(), err.to_detail());
        fields.insert("id".into(), serde_json::Value::String(id.to_string()));
        Self::new(
            EventKind::Error,
            EventDetail {
                fields,
                data: None,
            },
        )
    }

    pub fn init() -> Self {
        Self::new(EventKind::Init, EventDetail::default())
    }

    /// Call id carried in the detail, if any.
    pub fn call_id(&self) -> Option<&str> {
        self.detail.fields.get("id").and_then(|v| v.as_str())
    }
}
