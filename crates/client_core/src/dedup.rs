use std::collections::HashMap;

use tokio::{
    sync::Mutex,
    time::{Duration, Instant},
};

/// Time-bounded key set. Expired entries are swept on access rather than by
/// per-entry timers, so dropping the set drops all bookkeeping with it.
pub struct ExpiringSet {
    entries: Mutex<HashMap<String, Instant>>,
}

impl ExpiringSet {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `key` for `ttl` unless a live entry already exists.
    /// Returns `true` when the key was newly inserted.
    pub async fn insert_if_absent(&self, key: impl Into<String>, ttl: Duration) -> bool {
        let key = key.into();
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, expires_at| *expires_at > now);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, now + ttl);
        true
    }

    pub async fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, expires_at| *expires_at > now);
        entries.contains_key(key)
    }

    /// Returns `true` when a live entry was removed.
    pub async fn remove(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(expires_at) => expires_at > now,
            None => false,
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, expires_at| *expires_at > now);
        entries.len()
    }
}

impl Default for ExpiringSet {
    fn default() -> Self {
        Self::new()
    }
}
