use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Clone, Debug)]
struct Entry {
    value: Bytes,
    /// Absolute expiry in Unix milliseconds; 0 means never.
    expires_at_millis: i64,
}

impl Entry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at_millis != 0 && self.expires_at_millis <= now
    }
}

/// String key-value store with lazy expiry.
///
/// One lock guards the whole map. Every operation takes it for its full
/// duration and never across an `.await`.
#[derive(Default)]
pub struct InMemoryDB {
    map: Mutex<HashMap<Bytes, Entry>>,
}

impl InMemoryDB {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous entry. A positive
    /// `ttl_millis` makes the entry expire that many milliseconds from now.
    pub fn set(&self, key: Bytes, value: Bytes, ttl_millis: i64) {
        let expires_at_millis = if ttl_millis > 0 {
            now_millis().saturating_add(ttl_millis)
        } else {
            0
        };
        let entry = Entry { value, expires_at_millis };
        self.map.lock().insert(key, entry);
    }

    /// Returns the live value for `key`. An expired entry is removed here.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let mut map = self.map.lock();
        let entry = map.get(key)?;
        if !entry.is_expired(now_millis()) {
            return Some(entry.value.clone());
        }
        map.remove(key);
        None
    }

    /// Removes `key`. Returns whether a live entry was removed.
    pub fn delete(&self, key: &[u8]) -> bool {
        match self.map.lock().remove(key) {
            Some(entry) => !entry.is_expired(now_millis()),
            None => false,
        }
    }

    /// Number of physically stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is physically present, without applying expiry.
    pub fn holds(&self, key: &[u8]) -> bool {
        self.map.lock().contains_key(key)
    }
}
