use std::collections::HashMap;
use std::sync::RwLock;
use storage_proto::Status;

/// A key holds either a string value or an ordered list, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Value(String),
    List(Vec<String>),
}

/// The in-memory engine. Reads share the lock; every mutation — including
/// the read step of a list read-modify-write — runs under the exclusive
/// lock, so concurrent appends can never interleave.
///
/// Revocation ordering is the caller's concern: writes reach this engine
/// only after the lease pool has cleared the key.
#[derive(Default)]
pub struct KvStore {
    map: RwLock<HashMap<String, Entry>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the key is absent or holds a list.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.map.read().unwrap().get(key) {
            Some(Entry::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// `None` when the key is absent or holds a plain value.
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        match self.map.read().unwrap().get(key) {
            Some(Entry::List(items)) => Some(items.clone()),
            _ => None,
        }
    }

    /// Store a value, replacing whatever the key held.
    pub fn put(&self, key: &str, value: &str) -> Status {
        self.map
            .write()
            .unwrap()
            .insert(key.to_string(), Entry::Value(value.to_string()));
        Status::Ok
    }

    /// Append to a list, creating it on first use. Items are unique within
    /// a list; a list operation on a value-typed key fails the write.
    pub fn append(&self, key: &str, item: &str) -> Status {
        let mut map = self.map.write().unwrap();
        match map
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(Vec::new()))
        {
            Entry::List(items) => {
                if items.iter().any(|existing| existing == item) {
                    Status::ItemExists
                } else {
                    items.push(item.to_string());
                    Status::Ok
                }
            }
            Entry::Value(_) => Status::PutFailed,
        }
    }

    pub fn remove(&self, key: &str, item: &str) -> Status {
        let mut map = self.map.write().unwrap();
        match map.get_mut(key) {
            Some(Entry::List(items)) => match items.iter().position(|existing| existing == item) {
                Some(index) => {
                    items.remove(index);
                    Status::Ok
                }
                None => Status::ItemNotFound,
            },
            Some(Entry::Value(_)) => Status::ItemNotFound,
            None => Status::KeyNotFound,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.read().unwrap().contains_key(key)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn put_then_get_round_trips() {
        let store = KvStore::new();
        assert_eq!(store.get("k"), None);
        assert_eq!(store.put("k", "v"), Status::Ok);
        assert_eq!(store.get("k"), Some("v".to_string()));
        assert_eq!(store.put("k", "v2"), Status::Ok);
        assert_eq!(store.get("k"), Some("v2".to_string()));
    }

    #[test]
    fn lists_preserve_insertion_order_and_reject_duplicates() {
        let store = KvStore::new();
        assert_eq!(store.append("l", "a"), Status::Ok);
        assert_eq!(store.append("l", "b"), Status::Ok);
        assert_eq!(store.append("l", "a"), Status::ItemExists);
        assert_eq!(store.get_list("l"), Some(vec!["a".into(), "b".into()]));

        assert_eq!(store.remove("l", "a"), Status::Ok);
        assert_eq!(store.remove("l", "a"), Status::ItemNotFound);
        assert_eq!(store.get_list("l"), Some(vec!["b".into()]));
        assert_eq!(store.remove("missing", "a"), Status::KeyNotFound);
    }

    #[test]
    fn value_and_list_entries_are_mutually_exclusive() {
        let store = KvStore::new();
        store.put("k", "v");
        assert_eq!(store.append("k", "item"), Status::PutFailed);
        assert_eq!(store.get_list("k"), None);

        store.append("l", "item");
        assert_eq!(store.get("l"), None);
        assert_eq!(store.remove("k", "v"), Status::ItemNotFound);
    }

    #[test]
    fn concurrent_appends_never_lose_items() {
        let store = std::sync::Arc::new(KvStore::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        assert_eq!(store.append("l", &format!("{worker}-{i}")), Status::Ok);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get_list("l").unwrap().len(), 8 * 50);
    }
}
