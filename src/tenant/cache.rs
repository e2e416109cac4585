use crate::tenant::TenantRecord;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// TTL cache for subdomain → tenant lookups.
///
/// Entries are invalidated explicitly on every status change (the cache key
/// is scoped by subdomain), so a suspended tenant can't keep serving from a
/// stale `active` entry for up to a TTL.
pub struct TenantCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, TenantRecord)>>,
}

impl TenantCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached tenant for `subdomain`, or run `producer` and cache
    /// its result. A `None` from the producer is not cached.
    pub fn remember<F>(&self, subdomain: &str, producer: F) -> anyhow::Result<Option<TenantRecord>>
    where
        F: FnOnce() -> anyhow::Result<Option<TenantRecord>>,
    {
        {
            let map = self.entries.lock().expect("tenant cache lock poisoned");
            if let Some((stored_at, tenant)) = map.get(subdomain) {
                if stored_at.elapsed() < self.ttl {
                    return Ok(Some(tenant.clone()));
                }
            }
        }

        let produced = producer()?;
        if let Some(ref tenant) = produced {
            let mut map = self.entries.lock().expect("tenant cache lock poisoned");
            map.insert(subdomain.to_string(), (Instant::now(), tenant.clone()));
        }
        Ok(produced)
    }

    pub fn forget(&self, subdomain: &str) {
        let mut map = self.entries.lock().expect("tenant cache lock poisoned");
        map.remove(subdomain);
    }

    /// Drop all expired entries.
    pub fn cleanup(&self) {
        let mut map = self.entries.lock().expect("tenant cache lock poisoned");
        map.retain(|_, (stored_at, _)| stored_at.elapsed() < self.ttl);
    }
}
