use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::persistence::{PendingWrite, PersistenceTransaction};
use crate::firestore::model::{DocumentKey, Mutation, Overlay, ResourcePath};

/// Latest pending overlay per document for one user.
#[derive(Debug, Default)]
pub struct DocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    overlay_by_batch_id: BTreeMap<i32, BTreeSet<DocumentKey>>,
}

impl DocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(overlays: impl IntoIterator<Item = Overlay>) -> Self {
        let mut cache = Self::new();
        for overlay in overlays {
            cache.insert(overlay);
        }
        cache
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    pub fn get_overlay(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    pub fn get_overlays<'a>(&self, keys: impl IntoIterator<Item = &'a DocumentKey>) -> BTreeMap<DocumentKey, Overlay> {
        keys.into_iter()
            .filter_map(|key| self.overlays.get(key).map(|overlay| (key.clone(), overlay.clone())))
            .collect()
    }

    /// Stores one overlay per entry of `overlays`, replacing older ones.
    pub fn save_overlays(
        &mut self,
        txn: &mut PersistenceTransaction,
        largest_batch_id: i32,
        overlays: &BTreeMap<DocumentKey, Mutation>,
    ) {
        for mutation in overlays.values() {
            let overlay = Overlay::new(largest_batch_id, mutation.clone());
            txn.record(PendingWrite::Overlay(overlay.clone()));
            self.insert(overlay);
        }
    }

    /// Drops the overlays of `batch_id`. Keys whose overlay was since replaced by
    /// a later batch are left alone.
    pub fn remove_overlays_for_batch_id(
        &mut self,
        txn: &mut PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
        batch_id: i32,
    ) {
        let Some(owned) = self.overlay_by_batch_id.remove(&batch_id) else {
            return;
        };
        for key in owned.iter().filter(|key| keys.is_empty() || keys.contains(*key)) {
            if self.overlays.remove(key).is_some() {
                txn.record(PendingWrite::RemoveOverlay(key.clone()));
            }
        }
        let remaining: BTreeSet<_> = owned
            .into_iter()
            .filter(|key| !(keys.is_empty() || keys.contains(key)))
            .collect();
        if !remaining.is_empty() {
            self.overlay_by_batch_id.insert(batch_id, remaining);
        }
    }

    /// Overlays for documents directly inside `collection` newer than `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: i32,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let start = DocumentKey::from_path_unchecked(collection.clone());
        self.overlays
            .range(start..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, overlay)| {
                key.path().len() == collection.len() + 1 && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    /// Overlays in `collection_group` newer than `since_batch_id`, returned as
    /// whole batches in id order until at least `count` overlays are collected.
    pub fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: i32,
        count: usize,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let mut by_batch: BTreeMap<i32, BTreeMap<DocumentKey, Overlay>> = BTreeMap::new();
        for (key, overlay) in &self.overlays {
            if key.has_collection_id(collection_group) && overlay.largest_batch_id > since_batch_id {
                by_batch
                    .entry(overlay.largest_batch_id)
                    .or_default()
                    .insert(key.clone(), overlay.clone());
            }
        }

        let mut result = BTreeMap::new();
        for overlays in by_batch.into_values() {
            result.extend(overlays);
            if result.len() >= count {
                break;
            }
        }
        result
    }

    fn insert(&mut self, overlay: Overlay) {
        let key = overlay.key().clone();
        if let Some(existing) = self.overlays.get(&key) {
            let previous_batch = existing.largest_batch_id;
            if let Some(keys) = self.overlay_by_batch_id.get_mut(&previous_batch) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.overlay_by_batch_id.remove(&previous_batch);
                }
            }
        }
        self.overlay_by_batch_id
            .entry(overlay.largest_batch_id)
            .or_default()
            .insert(key.clone());
        self.overlays.insert(key, overlay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn save(cache: &mut DocumentOverlayCache, batch_id: i32, paths: &[&str]) {
        let overlays = paths
            .iter()
            .map(|path| (key(path), Mutation::set(key(path), MapValue::empty())))
            .collect();
        cache.save_overlays(&mut PersistenceTransaction::new("test", 1), batch_id, &overlays);
    }

    #[test]
    fn later_batches_replace_overlays() {
        let mut cache = DocumentOverlayCache::new();
        save(&mut cache, 1, &["rooms/a", "rooms/b"]);
        save(&mut cache, 2, &["rooms/a"]);
        assert_eq!(cache.get_overlay(&key("rooms/a")).unwrap().largest_batch_id, 2);

        let mut txn = PersistenceTransaction::new("test", 1);
        cache.remove_overlays_for_batch_id(&mut txn, &BTreeSet::new(), 1);
        assert!(cache.get_overlay(&key("rooms/b")).is_none());
        assert!(cache.get_overlay(&key("rooms/a")).is_some());
        assert_eq!(txn.writes(), &[PendingWrite::RemoveOverlay(key("rooms/b"))]);
    }

    #[test]
    fn collection_lookup_skips_nested_and_old_overlays() {
        let mut cache = DocumentOverlayCache::new();
        save(&mut cache, 1, &["rooms/a"]);
        save(&mut cache, 2, &["rooms/b", "rooms/b/messages/m"]);
        let path = ResourcePath::from_string("rooms").unwrap();
        let found = cache.get_overlays_for_collection(&path, 1);
        assert_eq!(found.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
        assert_eq!(cache.get_overlays_for_collection(&path, -1).len(), 2);
    }

    #[test]
    fn collection_group_returns_whole_batches() {
        let mut cache = DocumentOverlayCache::new();
        save(&mut cache, 1, &["a/1/messages/x", "a/2/messages/y"]);
        save(&mut cache, 2, &["a/3/messages/z"]);
        let found = cache.get_overlays_for_collection_group("messages", -1, 1);
        assert_eq!(found.len(), 2);
        let all = cache.get_overlays_for_collection_group("messages", -1, 10);
        assert_eq!(all.len(), 3);
    }
}
