//! Sharded series identity map.
//!
//! [`ShardSet`] assigns each distinct series a dense, globally unique id. The
//! series key is hashed once; the hash picks a shard and is then the probe
//! start inside that shard. Collisions walk forward through the hash space
//! comparing full series equality, so two different series never share an id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use crate::series::Series;

/// Default number of shards.
pub const DEFAULT_SHARD_COUNT: usize = 10;

type ShardHash = u32;

/// A stored series with the hash it was probed from.
#[derive(Debug)]
struct Slot {
    home: ShardHash,
    series: Series,
}

/// Open-addressed map of one shard. Not locked; the owning [`ShardSet`] locks it.
#[derive(Debug, Default)]
struct ShardMap {
    lookup: HashMap<ShardHash, Slot>,
}

impl ShardMap {
    fn find(&self, hash: ShardHash, series: &Series) -> Option<ShardHash> {
        let mut probe = hash;
        while let Some(slot) = self.lookup.get(&probe) {
            if slot.series.same_line(series) {
                return Some(probe);
            }
            probe = probe.wrapping_add(1);
        }
        None
    }

    fn get(&self, hash: ShardHash, series: &Series) -> Option<&Series> {
        self.find(hash, series)
            .and_then(|probe| self.lookup.get(&probe))
            .map(|slot| &slot.series)
    }

    fn set(&mut self, hash: ShardHash, series: Series) {
        let mut probe = hash;
        while let Some(slot) = self.lookup.get(&probe) {
            if slot.series.same_line(&series) {
                break;
            }
            probe = probe.wrapping_add(1);
        }
        self.lookup.insert(probe, Slot { home: hash, series });
    }

    /// Removes `series` and closes the gap it leaves in its probe run.
    fn remove(&mut self, hash: ShardHash, series: &Series) -> Option<Series> {
        let probe = self.find(hash, series)?;
        let removed = self.lookup.remove(&probe)?;

        // Entries after the gap may have probed past it; place them again.
        let mut next = probe.wrapping_add(1);
        let mut displaced = Vec::new();
        while let Some(slot) = self.lookup.remove(&next) {
            displaced.push(slot);
            next = next.wrapping_add(1);
        }
        for slot in displaced {
            self.set(slot.home, slot.series);
        }
        Some(removed.series)
    }

    fn len(&self) -> usize {
        self.lookup.len()
    }
}

/// A fixed set of independently locked shards issuing series ids.
#[derive(Debug)]
pub struct ShardSet {
    shards: Vec<RwLock<ShardMap>>,
    created: AtomicU32,
}

impl ShardSet {
    /// Creates a shard set with `size` shards (at least one).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let shards = (0..size).map(|_| RwLock::new(ShardMap::default())).collect();
        Self {
            shards,
            created: AtomicU32::new(0),
        }
    }

    fn hash(series: &Series) -> ShardHash {
        // Fold the 64-bit hash so the upper half still contributes.
        let h = xxh3_64(series.key().as_bytes());
        ((h >> 32) ^ h) as ShardHash
    }

    fn shard(&self, hash: ShardHash) -> &RwLock<ShardMap> {
        &self.shards[hash as usize % self.shards.len()]
    }

    /// Returns true if the series already has an id.
    #[must_use]
    pub fn contains(&self, series: &Series) -> bool {
        let hash = Self::hash(series);
        self.shard(hash).read().get(hash, series).is_some()
    }

    /// Resolves the id of `series`, assigning a new one on first sight.
    ///
    /// The id is also written back into `series`.
    pub fn put(&self, series: &mut Series) -> u32 {
        let hash = Self::hash(series);
        let mut shard = self.shard(hash).write();

        if let Some(existing) = shard.get(hash, series) {
            series.id = existing.id;
            return existing.id;
        }

        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        series.id = id;
        shard.set(hash, series.clone());
        id
    }

    /// Forgets `series`. Its id is never issued again.
    ///
    /// Returns the id it had, if it was stored.
    pub fn remove(&self, series: &Series) -> Option<u32> {
        let hash = Self::hash(series);
        self.shard(hash).write().remove(hash, series).map(|s| s.id)
    }

    /// Returns the number of shards.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shards.len()
    }

    /// Returns the highest id issued so far.
    #[must_use]
    pub fn max(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    /// Returns the number of distinct series stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Returns true if no series has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ShardSet {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn series(endpoint: &str, mount: &str) -> Series {
        let mut tags = BTreeMap::new();
        tags.insert("endpoint".to_string(), endpoint.to_string());
        tags.insert("mount".to_string(), mount.to_string());
        Series::new("disk.used", tags, 10, "GAUGE").unwrap()
    }

    mod put_tests {
        use super::*;

        #[test]
        fn test_ids_start_at_one() {
            let set = ShardSet::new(4);
            let mut s = series("h1", "/");
            assert_eq!(set.put(&mut s), 1);
            assert_eq!(s.id, 1);
            assert_eq!(set.max(), 1);
        }

        #[test]
        fn test_same_series_same_id() {
            let set = ShardSet::new(4);
            let mut a = series("h1", "/");
            let mut b = series("h1", "/");
            let id_a = set.put(&mut a);
            let id_b = set.put(&mut b);
            assert_eq!(id_a, id_b);
            assert_eq!(set.len(), 1);
        }

        #[test]
        fn test_distinct_series_distinct_ids() {
            let set = ShardSet::new(4);
            let ids: Vec<u32> = (0..50)
                .map(|i| set.put(&mut series(&format!("h{i}"), "/")))
                .collect();
            let mut sorted = ids.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), 50);
            assert_eq!(set.max(), 50);
        }

        #[test]
        fn test_contains() {
            let set = ShardSet::default();
            let mut s = series("h1", "/");
            assert!(!set.contains(&s));
            set.put(&mut s);
            assert!(set.contains(&s));
            assert_eq!(set.size(), DEFAULT_SHARD_COUNT);
        }

        #[test]
        fn test_zero_size_uses_one_shard() {
            let set = ShardSet::new(0);
            assert_eq!(set.size(), 1);
            assert!(set.is_empty());
        }
    }

    mod probe_tests {
        use super::*;

        #[test]
        fn test_collision_probes_forward() {
            let mut map = ShardMap::default();
            let mut a = series("h1", "/");
            a.id = 1;
            let mut b = series("h2", "/");
            b.id = 2;

            // Force both into the same probe start.
            map.set(7, a.clone());
            map.set(7, b.clone());

            assert_eq!(map.len(), 2);
            assert_eq!(map.get(7, &a).map(|s| s.id), Some(1));
            assert_eq!(map.get(7, &b).map(|s| s.id), Some(2));
            assert!(map.lookup.contains_key(&8));
        }

        #[test]
        fn test_probe_wraps_around() {
            let mut map = ShardMap::default();
            let a = series("h1", "/");
            let b = series("h2", "/");
            map.set(u32::MAX, a);
            map.set(u32::MAX, b.clone());
            assert!(map.lookup.contains_key(&0));
            assert!(map.get(u32::MAX, &b).is_some());
        }
    }

    mod remove_tests {
        use super::*;

        #[test]
        fn test_remove_forgets_series() {
            let set = ShardSet::new(4);
            let mut s = series("h1", "/");
            let id = set.put(&mut s);
            assert_eq!(set.remove(&s), Some(id));
            assert!(!set.contains(&s));
            assert!(set.is_empty());
            assert_eq!(set.remove(&s), None);
        }

        #[test]
        fn test_readded_series_gets_fresh_id() {
            let set = ShardSet::new(4);
            let mut s = series("h1", "/");
            let first = set.put(&mut s);
            set.remove(&s);
            assert_eq!(set.put(&mut s), first + 1);
        }

        #[test]
        fn test_remove_keeps_later_collisions_reachable() {
            let mut map = ShardMap::default();
            let a = series("h1", "/");
            let b = series("h2", "/");
            let c = series("h3", "/");
            map.set(7, a.clone());
            map.set(7, b.clone());
            map.set(8, c.clone());

            assert!(map.remove(7, &a).is_some());
            assert_eq!(map.len(), 2);
            assert!(map.get(7, &b).is_some());
            assert!(map.get(8, &c).is_some());
            assert!(map.lookup.contains_key(&7));
        }

        #[test]
        fn test_remove_across_wrap() {
            let mut map = ShardMap::default();
            let a = series("h1", "/");
            let b = series("h2", "/");
            map.set(u32::MAX, a.clone());
            map.set(u32::MAX, b.clone());
            assert!(map.remove(u32::MAX, &a).is_some());
            assert!(map.get(u32::MAX, &b).is_some());
            assert!(map.lookup.contains_key(&u32::MAX));
        }
    }

    mod concurrency_tests {
        use super::*;

        #[test]
        fn test_concurrent_put_assigns_one_id_per_series() {
            let set = Arc::new(ShardSet::new(8));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let set = Arc::clone(&set);
                    std::thread::spawn(move || {
                        (0..100)
                            .map(|i| set.put(&mut series(&format!("h{i}"), "/")))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            let results: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            for r in &results[1..] {
                assert_eq!(r, &results[0]);
            }
            assert_eq!(set.max(), 100);
        }
    }
}
