//! The persistent key-value store boundary (§6). Upper-layer handlers
//! use this; the core never constructs a concrete implementation.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key-value store backend error: {0}")]
    Backend(String),
}

/// Async trait boundary for the external persistent store. Real
/// implementations (file-backed, RocksDB-backed, whatever the
/// deployment chooses) live outside this crate entirely.
#[async_trait]
pub trait KVStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
    /// All `(key, value)` pairs whose key starts with `prefix`.
    async fn iterate(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError>;
}
