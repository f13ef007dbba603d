//! Plain key/value and list operations.
//!
//! Used by the CLI's `kv` commands; the stream core does not depend on it.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportResult;

/// Key/value store with blocking list pops.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Prepends values to a list (each value goes to the head in turn).
    async fn lpush(&self, key: &str, values: &[&str]) -> TransportResult<u64>;

    /// Appends values to a list.
    async fn rpush(&self, key: &str, values: &[&str]) -> TransportResult<u64>;

    /// Pops from the head of the first non-empty list, waiting up to `timeout`.
    ///
    /// Returns `(key, value)`, or `None` on timeout. `Duration::ZERO` waits
    /// forever.
    async fn blpop(&self, keys: &[&str], timeout: Duration) -> TransportResult<Option<(String, String)>>;

    /// Pops from the tail of the first non-empty list, waiting up to `timeout`.
    async fn brpop(&self, keys: &[&str], timeout: Duration) -> TransportResult<Option<(String, String)>>;

    /// Sets a string value with an optional expiry.
    async fn set(&self, key: &str, value: &str, expiry: Option<Duration>) -> TransportResult<()>;

    /// Gets a string value.
    async fn get(&self, key: &str) -> TransportResult<Option<String>>;

    /// Deletes keys and returns how many existed.
    async fn del(&self, keys: &[&str]) -> TransportResult<u64>;

    /// Removes every key in the current database.
    async fn flush(&self) -> TransportResult<()>;
}
