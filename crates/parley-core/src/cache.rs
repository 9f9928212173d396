//! Process-wide conversation snapshot cache.
//!
//! Entries are replaced whole, so readers never observe a partially updated
//! snapshot. Snapshots are never removed except by capacity eviction, which
//! drops the least-recently-written entry.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::envelope::Conversation;

#[derive(Default)]
struct Entries {
    tick: u64,
    map: HashMap<String, (u64, Arc<Conversation>)>,
}

pub struct SnapshotCache {
    capacity: Option<usize>,
    entries: RwLock<Entries>,
}

impl SnapshotCache {
    /// `None` keeps every snapshot.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Store `conversation` under its id. Conversations without an id are not cached.
    pub fn put(&self, conversation: Conversation) -> Option<Arc<Conversation>> {
        let key = conversation.id.clone()?;
        let snapshot = Arc::new(conversation);
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        entries.tick += 1;
        let tick = entries.tick;

        if let Some(cap) = self.capacity {
            if !entries.map.contains_key(&key) && entries.map.len() >= cap.max(1) {
                let oldest = entries
                    .map
                    .iter()
                    .min_by_key(|(_, (written, _))| *written)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.map.remove(&oldest);
                }
            }
        }

        entries.map.insert(key, (tick, snapshot.clone()));
        Some(snapshot)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Conversation>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map
            .get(id)
            .map(|(_, c)| c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conv(id: &str, lang: &str) -> Conversation {
        let mut c = Conversation {
            id: Some(id.to_string()),
            ..Default::default()
        };
        c.meta.insert("lang".to_string(), json!(lang));
        c
    }

    #[test]
    fn replaces_whole_snapshot() {
        let cache = SnapshotCache::new(None);
        let first = cache.put(conv("c1", "en")).unwrap();
        cache.put(conv("c1", "fr"));

        assert_eq!(first.meta["lang"], "en");
        assert_eq!(cache.get("c1").unwrap().meta["lang"], "fr");
        assert!(cache.get("c2").is_none());
    }

    #[test]
    fn conversations_without_id_are_skipped() {
        let cache = SnapshotCache::new(Some(1));
        cache.put(conv("c1", "en"));
        assert!(cache.put(Conversation::default()).is_none());
        assert!(cache.get("c1").is_some());
    }

    #[test]
    fn unbounded_by_default() {
        let cache = SnapshotCache::new(None);
        for i in 0..100 {
            cache.put(conv(&format!("c{i}"), "en"));
        }
        assert!((0..100).all(|i| cache.get(&format!("c{i}")).is_some()));
    }

    #[test]
    fn capacity_evicts_least_recently_written() {
        let cache = SnapshotCache::new(Some(2));
        cache.put(conv("a", "en"));
        cache.put(conv("b", "en"));
        cache.put(conv("a", "de"));
        cache.put(conv("c", "en"));

        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").unwrap().meta["lang"], "de");
        assert!(cache.get("c").is_some());
    }
}
