//! Content-addressed cache of merged mesh buffers.
//!
//! Keyed by the native content hash of the merge-eligible primitive set plus
//! format flags, so avatars and LODs that happen to batch identically share
//! one buffer instead of re-extracting it. Process-wide shared state, created
//! at engine start and injected where needed; the mutex makes it safe for
//! bridge implementations that call in from worker threads.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::merge::MergedMeshBuffer;

/// Cache key: content hash of the merge-eligible set plus format flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MergeKey {
    pub content_hash: u64,
    pub format_flags: u32,
}

/// Shared merged-mesh cache. Entries are weak: a buffer lives as long as some
/// LOD holds it, and the dead entry leaves the map on the next purge — never
/// while a reference is outstanding.
#[derive(Default)]
pub struct ContentAddressedCache {
    entries: Mutex<FxHashMap<MergeKey, Weak<MergedMeshBuffer>>>,
}

impl ContentAddressedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a previously built buffer. A hit returns a new strong
    /// reference and skips all native extraction work at the call site.
    pub fn lookup(&self, key: MergeKey) -> Option<Arc<MergedMeshBuffer>> {
        let entries = self.entries.lock();
        let buffer = entries.get(&key)?.upgrade();
        if buffer.is_some() {
            log::debug!("[MeshCache] hit for {:016x}", key.content_hash);
        }
        buffer
    }

    pub fn insert(&self, key: MergeKey, buffer: &Arc<MergedMeshBuffer>) {
        let mut entries = self.entries.lock();
        entries.insert(key, Arc::downgrade(buffer));
        log::debug!(
            "[MeshCache] inserted {:016x} ({} entries)",
            key.content_hash,
            entries.len()
        );
    }

    /// Drop entries whose buffer is gone. Called from the end-of-frame hook.
    pub fn purge_dead(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, weak| weak.strong_count() > 0);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Engine shutdown: drop every entry outright.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_buffer(key: MergeKey) -> Arc<MergedMeshBuffer> {
        Arc::new(MergedMeshBuffer::empty_for_tests(key))
    }

    fn key(hash: u64) -> MergeKey {
        MergeKey {
            content_hash: hash,
            format_flags: 0,
        }
    }

    #[test]
    fn test_hit_increments_reference() {
        let cache = ContentAddressedCache::new();
        let buffer = empty_buffer(key(0xAB));
        cache.insert(key(0xAB), &buffer);

        let hit = cache.lookup(key(0xAB)).expect("hit");
        assert_eq!(Arc::strong_count(&buffer), 2);
        drop(hit);
        assert_eq!(Arc::strong_count(&buffer), 1);
    }

    #[test]
    fn test_miss_on_unknown_and_format_flags() {
        let cache = ContentAddressedCache::new();
        let buffer = empty_buffer(key(0xCD));
        cache.insert(key(0xCD), &buffer);

        assert!(cache.lookup(key(0xCE)).is_none());
        let other_format = MergeKey {
            content_hash: 0xCD,
            format_flags: 1,
        };
        assert!(cache.lookup(other_format).is_none());
    }

    #[test]
    fn test_entry_survives_until_last_reference() {
        let cache = ContentAddressedCache::new();
        let buffer = empty_buffer(key(1));
        cache.insert(key(1), &buffer);

        assert_eq!(cache.purge_dead(), 0);
        assert_eq!(cache.len(), 1);

        drop(buffer);
        assert!(cache.lookup(key(1)).is_none());
        assert_eq!(cache.purge_dead(), 1);
        assert!(cache.is_empty());
    }
}
