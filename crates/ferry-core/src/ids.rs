use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

branded_id!(CallId, "call");
branded_id!(ContextId, "ctx");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_has_prefix() {
        let id = CallId::new();
        assert!(id.as_str().starts_with("call_"), "got: {id}");
    }

    #[test]
    fn context_id_has_prefix() {
        let id = ContextId::new();
        assert!(id.as_str().starts_with("ctx_"), "got: {id}");
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = CallId::from_raw("4242");
        assert_eq!(id.as_str(), "4242");
        assert_eq!(id.to_string(), "4242");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = CallId::from_raw("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""abc""#);
    }
}
