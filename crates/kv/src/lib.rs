//! Persistent key-value state shared by locators and the CLI.
//!
//! Values are `serde_json::Value` at the API boundary; the wire encoding is
//! selected per store. Keys are UTF-8 strings, optionally namespaced by a
//! prefix bound at construction or overridden per call.

mod memory;
mod redis;

pub use self::memory::{MemoryKvStore, MemoryStats};
pub use self::redis::{RedisConfig, RedisKvStore};

use serde_json::Value;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key-value backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("failed to encode stored value: {0}")]
    Encode(String),
    #[error("failed to decode stored value: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, KvError>;

/// Wire encoding for stored values. `Json` is the preferred, debuggable
/// encoding; `Binary` is MessagePack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Serializer {
    #[default]
    Json,
    Binary,
}

impl Serializer {
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        match self {
            Serializer::Json => {
                serde_json::to_vec(value).map_err(|err| KvError::Encode(err.to_string()))
            }
            Serializer::Binary => {
                rmp_serde::to_vec(value).map_err(|err| KvError::Encode(err.to_string()))
            }
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        match self {
            Serializer::Json => {
                serde_json::from_slice(bytes).map_err(|err| KvError::Decode(err.to_string()))
            }
            Serializer::Binary => {
                rmp_serde::from_slice(bytes).map_err(|err| KvError::Decode(err.to_string()))
            }
        }
    }
}

/// Namespaced get/put/delete/range over string keys.
///
/// A `prefix` argument of `None` uses the store's default prefix; `Some`
/// overrides it for that call. All implementations are safe for concurrent
/// use. Individual operations never partially commit within one key.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Store `value` under `key`. A `ttl` of `None` uses the store default;
    /// a zero duration means no expiry.
    async fn put(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        prefix: Option<&str>,
    ) -> Result<()>;

    async fn get(&self, key: &str, prefix: Option<&str>) -> Result<Option<Value>>;

    /// Returns true if the key existed and was removed.
    async fn delete(&self, key: &str, prefix: Option<&str>) -> Result<bool>;

    async fn exists(&self, key: &str, prefix: Option<&str>) -> Result<bool>;

    /// Pairs with `start_key <= key < end_key`, in ascending key order.
    /// Returned keys have the effective prefix stripped.
    async fn range_get(
        &self,
        start_key: &str,
        end_key: Option<&str>,
        limit: Option<usize>,
        prefix: Option<&str>,
    ) -> Result<Vec<(String, Value)>>;

    /// Release backend resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Join `prefix` and `key` with a `:` separator. An empty prefix leaves the
/// key untouched.
pub(crate) fn prefixed_key(key: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else if prefix.ends_with(':') {
        format!("{prefix}{key}")
    } else {
        format!("{prefix}:{key}")
    }
}

/// Resolve the TTL actually applied to a write. Zero (or shorter) durations
/// disable expiry entirely.
pub(crate) fn effective_ttl(
    ttl: Option<Duration>,
    default_ttl: Option<Duration>,
) -> Option<Duration> {
    ttl.or(default_ttl).filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefix_joining() {
        assert_eq!(prefixed_key("state", ""), "state");
        assert_eq!(prefixed_key("state", "trawl"), "trawl:state");
        assert_eq!(prefixed_key("state", "trawl:"), "trawl:state");
    }

    #[test]
    fn serializer_round_trips() {
        let value = json!({"cursor": "*", "count": 42, "urls": ["a", "b"]});
        for serializer in [Serializer::Json, Serializer::Binary] {
            let bytes = serializer.encode(&value).unwrap();
            assert_eq!(serializer.decode(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let default = Some(Duration::from_secs(60));
        assert_eq!(effective_ttl(None, default), default);
        assert_eq!(effective_ttl(Some(Duration::ZERO), default), None);
        assert_eq!(
            effective_ttl(Some(Duration::from_secs(5)), default),
            Some(Duration::from_secs(5))
        );
    }
}
