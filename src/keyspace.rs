//! The in-memory dataset: a map from byte-string key to value record with
//! optional absolute expiration, enforced lazily at read time. Keys are
//! `Vec<u8>` rather than `String` since snapshot round-tripping requires
//! keys that aren't necessarily valid UTF-8.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

/// Value record stored for a single key. `type_tag` is always 0 (byte
/// string) in this design but is kept as a field so the snapshot codec has
/// somewhere to round-trip it from.
#[derive(Clone, Debug)]
pub struct ValueRecord {
    pub value: Bytes,
    pub expires_at_ms: Option<u64>,
    pub type_tag: u8,
}

impl ValueRecord {
    fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at_ms, Some(at) if now >= at)
    }
}

#[derive(Default)]
pub struct Keyspace {
    map: HashMap<Vec<u8>, ValueRecord>,
}

impl Keyspace {
    pub fn new() -> Self {
        Keyspace {
            map: HashMap::new(),
        }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Bytes, expires_at_ms: Option<u64>) {
        self.map.insert(
            key,
            ValueRecord {
                value,
                expires_at_ms,
                type_tag: 0,
            },
        );
    }

    /// Looks up `key`, dropping it if its expiration has passed.
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        let now = now_ms();
        match self.map.get(key) {
            Some(record) if record.is_expired(now) => {
                self.map.remove(key);
                None
            }
            Some(record) => Some(record.value.clone()),
            None => None,
        }
    }

    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.map.remove(key).is_some()
    }

    /// Unordered iteration over currently-live keys. Expired-but-not-yet-
    /// probed records are skipped but not evicted (lazy expiry).
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let now = now_ms();
        self.map
            .iter()
            .filter(|(_, record)| !record.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Iterator over every stored record, live or not-yet-expired-and-probed,
    /// used by the snapshot writer which wants a single consistent view
    /// taken while holding the keyspace lock.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &ValueRecord)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn expiring_len(&self) -> usize {
        self.map
            .values()
            .filter(|record| record.expires_at_ms.is_some())
            .count()
    }

    /// Replaces the entire dataset, used when a replica ingests the initial
    /// snapshot from its primary.
    pub fn replace(&mut self, other: Keyspace) {
        self.map = other.map;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_then_get_returns_value() {
        let mut ks = Keyspace::new();
        ks.put(b"foo".to_vec(), Bytes::from_static(b"bar"), None);
        assert_eq!(ks.get(b"foo"), Some(Bytes::from_static(b"bar")));
    }

    #[test]
    fn get_on_unset_key_is_miss() {
        let mut ks = Keyspace::new();
        assert_eq!(ks.get(b"missing"), None);
    }

    #[test]
    fn expired_record_reads_as_miss_and_is_evicted() {
        let mut ks = Keyspace::new();
        ks.put(b"foo".to_vec(), Bytes::from_static(b"bar"), Some(now_ms() - 1));
        assert_eq!(ks.get(b"foo"), None);
        assert_eq!(ks.len(), 0);
    }

    #[test]
    fn future_expiry_is_still_live() {
        let mut ks = Keyspace::new();
        ks.put(
            b"foo".to_vec(),
            Bytes::from_static(b"bar"),
            Some(now_ms() + 100_000),
        );
        assert_eq!(ks.get(b"foo"), Some(Bytes::from_static(b"bar")));
    }

    #[test]
    fn delete_removes_key() {
        let mut ks = Keyspace::new();
        ks.put(b"foo".to_vec(), Bytes::from_static(b"bar"), None);
        assert!(ks.delete(b"foo"));
        assert_eq!(ks.get(b"foo"), None);
    }

    #[test]
    fn keys_skips_expired() {
        let mut ks = Keyspace::new();
        ks.put(b"live".to_vec(), Bytes::from_static(b"1"), None);
        ks.put(b"dead".to_vec(), Bytes::from_static(b"2"), Some(now_ms() - 1));
        assert_eq!(ks.keys(), vec![b"live".to_vec()]);
    }
}
