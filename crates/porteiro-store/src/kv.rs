//! Key-value store seam.
//!
//! The pipeline needs exactly the primitives listed here: atomic
//! set-if-absent with TTL, plain get/set/delete, TTL read, atomic
//! read-and-delete, and an increment with TTL refresh. A Redis client or
//! the in-process [`MemoryKv`](crate::memory::MemoryKv) both fit.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically set `key` to `value` with `ttl` only if the key is absent
    /// (or expired). Returns `true` when this call performed the write.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Returns `true` when a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomic read-and-delete. At most one concurrent caller observes the value.
    async fn take(&self, key: &str) -> Result<Option<String>>;

    /// Remaining lifetime of a live key, `None` when absent or expired.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Increment the integer at `key` (absent counts as 0) and refresh its
    /// TTL. Returns the post-increment value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64>;
}
