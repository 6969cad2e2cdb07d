//! In-process [`KvStore`] backed by a `DashMap`.
//!
//! Expiry is lazy: entries past their deadline are treated as absent and
//! removed on the next touch. Suitable for single-node deployments and
//! tests; multi-worker deployments point the same trait at Redis.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::Result;
use crate::kv::KvStore;

struct Slot {
    value: String,
    expires_at: Instant,
}

impl Slot {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Default)]
pub struct MemoryKv {
    slots: DashMap<String, Slot>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live() {
                    Ok(false)
                } else {
                    occupied.insert(Slot::new(value, ttl));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let expired = match self.slots.get(key) {
            Some(slot) if slot.live() => return Ok(Some(slot.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.slots.remove_if(key, |_, slot| !slot.live());
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.slots.insert(key.to_string(), Slot::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .slots
            .remove(key)
            .map(|(_, slot)| slot.live())
            .unwrap_or(false))
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .slots
            .remove(key)
            .and_then(|(_, slot)| slot.live().then_some(slot.value)))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.slots.get(key).and_then(|slot| {
            let now = Instant::now();
            (now < slot.expires_at).then(|| slot.expires_at - now)
        }))
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let next = if occupied.get().live() {
                    occupied.get().value.parse::<i64>().unwrap_or(0) + 1
                } else {
                    1
                };
                occupied.insert(Slot::new(&next.to_string(), ttl));
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new("1", ttl));
                Ok(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn set_if_absent_first_write_wins() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("k", "a", TTL).await.unwrap());
        assert!(!kv.set_if_absent("k", "b", TTL).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_key_reads_as_absent() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Duration::from_millis(0)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
        // and can be re-claimed by set_if_absent
        assert!(kv.set_if_absent("k", "w", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn take_removes_the_value() {
        let kv = MemoryKv::new();
        kv.set("k", "v", TTL).await.unwrap();
        assert_eq!(kv.take("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(kv.take("k").await.unwrap(), None);
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_reports_liveness() {
        let kv = MemoryKv::new();
        kv.set("k", "v", TTL).await.unwrap();
        assert!(kv.delete("k").await.unwrap());
        assert!(!kv.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn incr_counts_and_restarts_after_expiry() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("n", TTL).await.unwrap(), 1);
        assert_eq!(kv.incr("n", TTL).await.unwrap(), 2);
        kv.set("n", "7", Duration::from_millis(0)).await.unwrap();
        assert_eq!(kv.incr("n", TTL).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ttl_reports_remaining_time() {
        let kv = MemoryKv::new();
        kv.set("k", "v", TTL).await.unwrap();
        let remaining = kv.ttl("k").await.unwrap().unwrap();
        assert!(remaining <= TTL);
        assert!(remaining > Duration::from_secs(50));
        assert_eq!(kv.ttl("missing").await.unwrap(), None);
    }
}
