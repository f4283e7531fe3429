//! In-memory cache of chain results, shared by all build workers.
//!
//! Entries are keyed by (hash of the stage input, identity of the remaining
//! chain, mode).  Each key owns a slot with its own mutex: at most one worker
//! computes a given key while others wait for its result, and workers on
//! other keys never contend.  Slots are pinned while a caller holds them, and
//! eviction only considers unpinned slots.
//!
//! Lock order: a worker holding slot k may lock the slot for the next stage of
//! the same chain, whose chain suffix is strictly shorter, so waits can't
//! form a cycle.  Map shard locks are never held while waiting on a slot.

use crate::error::CacheCorruption;
use crate::hash::{ChainId, ContentHash};
use crate::stage::{Mode, SideOutput};
use dashmap::DashMap;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub content: ContentHash,
    pub chain: ChainId,
    pub mode: Mode,
}

/// The product of running a chain: the final content plus the side outputs
/// of every stage, in stage order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    pub content: Vec<u8>,
    pub side: Vec<SideOutput>,
}

impl Transformed {
    fn checksum(&self) -> ContentHash {
        let mut buf = self.content.clone();
        for side in &self.side {
            buf.push(0x1F);
            buf.extend_from_slice(side.ext.as_bytes());
            buf.push(0x1F);
            buf.extend_from_slice(&side.content);
        }
        ContentHash::of(&buf)
    }
}

struct Entry {
    key: CacheKey,
    /// Hash of the source file version this entry was derived from.
    origin: ContentHash,
    value: Arc<Transformed>,
    checksum: ContentHash,
}

#[derive(Default)]
struct Slot {
    entry: Mutex<Option<Entry>>,
    pins: AtomicUsize,
    last_access: AtomicU64,
}

/// A slot held by a caller; unpins on drop.
struct Pinned {
    slot: Arc<Slot>,
}

impl Drop for Pinned {
    fn drop(&mut self) {
        self.slot.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A worker that panicked mid-compute left the entry empty, which is a
    // valid state, so poisoning carries no information here.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub corruptions: usize,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicUsize,
    misses: AtomicUsize,
    evictions: AtomicUsize,
    corruptions: AtomicUsize,
}

pub struct ArtifactCache {
    slots: DashMap<CacheKey, Arc<Slot>, BuildHasherDefault<FxHasher>>,
    capacity: usize,
    clock: AtomicU64,
    counters: Counters,
}

impl ArtifactCache {
    pub fn new(capacity: usize) -> Self {
        ArtifactCache {
            slots: DashMap::with_hasher(BuildHasherDefault::default()),
            capacity,
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots, including ones whose computation is in flight.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::SeqCst),
            misses: self.counters.misses.load(Ordering::SeqCst),
            evictions: self.counters.evictions.load(Ordering::SeqCst),
            corruptions: self.counters.corruptions.load(Ordering::SeqCst),
            entries: self.slots.len(),
        }
    }

    /// Get or create the slot for `key`, pinned.
    fn pin(&self, key: CacheKey) -> Pinned {
        let slot = self.slots.entry(key).or_default();
        // Pinned under the shard lock, so eviction can't race the increment.
        slot.pins.fetch_add(1, Ordering::SeqCst);
        Pinned {
            slot: slot.value().clone(),
        }
    }

    fn touch(&self, slot: &Slot) {
        let now = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        slot.last_access.store(now, Ordering::SeqCst);
    }

    /// Read a slot's entry, verifying it.  A corrupt entry is dropped from
    /// the slot and reported; callers treat that as a miss.
    fn read_entry(
        &self,
        key: &CacheKey,
        slot: &Slot,
        entry: &mut Option<Entry>,
    ) -> Result<Option<Arc<Transformed>>, CacheCorruption> {
        let valid = match entry.as_ref() {
            None => {
                self.counters.misses.fetch_add(1, Ordering::SeqCst);
                return Ok(None);
            }
            Some(e) => e.key == *key && e.value.checksum() == e.checksum,
        };
        if !valid {
            *entry = None;
            self.counters.corruptions.fetch_add(1, Ordering::SeqCst);
            self.counters.misses.fetch_add(1, Ordering::SeqCst);
            return Err(CacheCorruption { key: *key });
        }
        self.touch(slot);
        self.counters.hits.fetch_add(1, Ordering::SeqCst);
        Ok(entry.as_ref().map(|e| e.value.clone()))
    }

    pub fn get(&self, key: &CacheKey) -> Result<Option<Arc<Transformed>>, CacheCorruption> {
        let pinned = match self.slots.get(key) {
            Some(slot) => {
                slot.pins.fetch_add(1, Ordering::SeqCst);
                Pinned {
                    slot: slot.value().clone(),
                }
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::SeqCst);
                return Ok(None);
            }
        };
        let mut entry = lock(&pinned.slot.entry);
        self.read_entry(key, &pinned.slot, &mut entry)
    }

    pub fn put(&self, key: CacheKey, origin: ContentHash, value: Transformed) -> Arc<Transformed> {
        let value = Arc::new(value);
        {
            let pinned = self.pin(key);
            let mut entry = lock(&pinned.slot.entry);
            *entry = Some(Entry {
                key,
                origin,
                checksum: value.checksum(),
                value: value.clone(),
            });
            self.touch(&pinned.slot);
        }
        self.evict();
        value
    }

    /// Return the entry for `key`, computing and storing it on a miss.
    /// Concurrent callers with the same key wait for the first one and share
    /// its result; the returned flag is true on a cache hit.
    /// A failed computation stores nothing.
    pub fn get_or_try_insert<E>(
        &self,
        key: CacheKey,
        origin: ContentHash,
        compute: impl FnOnce() -> Result<Transformed, E>,
    ) -> Result<(Arc<Transformed>, bool), E> {
        let result = {
            let pinned = self.pin(key);
            let mut entry = lock(&pinned.slot.entry);
            if let Ok(Some(value)) = self.read_entry(&key, &pinned.slot, &mut entry) {
                return Ok((value, true));
            }
            match compute() {
                Ok(value) => {
                    let value = Arc::new(value);
                    *entry = Some(Entry {
                        key,
                        origin,
                        checksum: value.checksum(),
                        value: value.clone(),
                    });
                    self.touch(&pinned.slot);
                    Ok(value)
                }
                Err(err) => Err(err),
            }
        };
        match result {
            Ok(value) => {
                self.evict();
                Ok((value, false))
            }
            Err(err) => {
                self.remove_empty(&key);
                Err(err)
            }
        }
    }

    /// Drop the slot for `key` if nobody holds it and it has no entry.
    fn remove_empty(&self, key: &CacheKey) {
        self.slots.remove_if(key, |_, slot| {
            slot.pins.load(Ordering::SeqCst) == 0
                && matches!(slot.entry.try_lock().as_deref(), Ok(None))
        });
    }

    /// Evict least recently used unpinned slots until within capacity.
    fn evict(&self) {
        let excess = self.slots.len().saturating_sub(self.capacity);
        for _ in 0..excess {
            let victim = self
                .slots
                .iter()
                .filter(|slot| slot.pins.load(Ordering::SeqCst) == 0)
                .min_by_key(|slot| slot.last_access.load(Ordering::SeqCst))
                .map(|slot| *slot.key());
            let key = match victim {
                Some(key) => key,
                None => break,
            };
            let removed = self
                .slots
                .remove_if(&key, |_, slot| slot.pins.load(Ordering::SeqCst) == 0);
            if let Some((_, slot)) = removed {
                if lock(&slot.entry).is_some() {
                    self.counters.evictions.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Remove every entry for which `pred(key, origin)` holds; returns the
    /// number removed.  Slots in use are left alone: their keys are content
    /// addressed, so they are still correct, merely possibly unused.
    pub fn invalidate(&self, mut pred: impl FnMut(&CacheKey, &ContentHash) -> bool) -> usize {
        let mut removed = 0;
        self.slots.retain(|key, slot| {
            if slot.pins.load(Ordering::SeqCst) > 0 {
                return true;
            }
            // try_lock: blocking on a slot under a shard lock could deadlock
            // with a worker that holds the slot and wants the shard.
            let entry = match slot.entry.try_lock() {
                Ok(entry) => entry,
                Err(_) => return true,
            };
            match entry.as_ref() {
                Some(e) if pred(key, &e.origin) => {
                    removed += 1;
                    false
                }
                _ => true,
            }
        });
        removed
    }

    /// Invalidate everything derived from one version of a source file.
    pub fn invalidate_origin(&self, origin: ContentHash) -> usize {
        self.invalidate(|key, from| *from == origin || key.content == origin)
    }

    #[cfg(test)]
    fn corrupt(&self, key: &CacheKey) {
        let slot = self.slots.get(key).map(|s| s.value().clone());
        if let Some(slot) = slot {
            if let Some(entry) = lock(&slot.entry).as_mut() {
                entry.checksum = ContentHash::of(b"garbage");
            }
        }
    }
}
