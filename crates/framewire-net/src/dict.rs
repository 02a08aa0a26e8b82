//! Open-hash map keyed by [`Value`], with an LRU lookup cache and
//! power-of-two bucket resize. Used to index TCP clients by handle and to
//! parse records.
//!
//! Entries live in an arena (`entries: Vec<Option<Entry<V>>>`) addressed by
//! a stable slot id (§9 design note: intrusive lists and back-pointers are
//! modeled as arena + index rather than raw cyclic pointers). Buckets chain
//! their entries through `next_in_bucket`; a second, independent chain
//! (`prev_live`/`next_live`) threads every live entry in insertion order for
//! O(1) `pos_head`/`pos_next` iteration.

use framewire_utils::{safe_assert, ArrayVec};

use crate::value::Value;

const LRU_SIZE: usize = 128;
const INITIAL_SHIFT: u32 = 6; // 64 buckets

struct Entry<V> {
    key: Value<'static>,
    val: V,
    hash: u64,
    serial: u64,
    next_in_bucket: Option<usize>,
    prev_live: Option<usize>,
    next_live: Option<usize>,
}

/// Open-hash dictionary. `V` is the stored value type; keys are
/// [`Value`]`<'static>`.
pub struct Dict<V> {
    buckets: Vec<Option<usize>>,
    mask: usize,
    entries: Vec<Option<Entry<V>>>,
    free_slots: Vec<usize>,
    size: usize,
    next_serial: u64,
    lru: ArrayVec<Option<usize>, LRU_SIZE>,
    live_head: Option<usize>,
    live_tail: Option<usize>,
}

impl<V> Default for Dict<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Dict<V> {
    pub fn new() -> Self {
        let length = 1usize << INITIAL_SHIFT;
        let mut lru = ArrayVec::new();
        lru.resize(LRU_SIZE, None);
        Self {
            buckets: vec![None; length],
            mask: length - 1,
            entries: Vec::new(),
            free_slots: Vec::new(),
            size: 0,
            next_serial: 0,
            lru,
            live_head: None,
            live_tail: None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn lru_index(hash: u64) -> usize {
        ((hash ^ (hash >> 16)) as usize) & (LRU_SIZE - 1)
    }

    /// Walks the bucket chain for `key`, checking the LRU cache first.
    /// Returns the entry's slot id.
    fn find_slot(&self, key: &Value<'_>) -> Option<usize> {
        let hash = key.hash();
        let lru_idx = Self::lru_index(hash);

        if let Some(slot) = self.lru[lru_idx]
            && let Some(entry) = self.entry(slot)
            && entry.hash == hash
            && entry.key.value_eq(key)
        {
            return Some(slot);
        }

        let bucket = hash as usize & self.mask;
        let mut cur = self.buckets[bucket];
        while let Some(slot) = cur {
            let entry = self.entry(slot).expect("bucket chain points at freed slot");
            if entry.hash == hash && entry.key.value_eq(key) {
                return Some(slot);
            }
            cur = entry.next_in_bucket;
        }
        None
    }

    fn entry(&self, slot: usize) -> Option<&Entry<V>> {
        self.entries.get(slot).and_then(|e| e.as_ref())
    }

    fn entry_mut(&mut self, slot: usize) -> Option<&mut Entry<V>> {
        self.entries.get_mut(slot).and_then(|e| e.as_mut())
    }

    pub fn search(&self, key: &Value<'_>) -> Option<&V> {
        let slot = self.find_slot(key)?;
        self.entry(slot).map(|e| &e.val)
    }

    pub fn search_mut(&mut self, key: &Value<'_>) -> Option<&mut V> {
        let slot = self.find_slot(key)?;
        self.entry_mut(slot).map(|e| &mut e.val)
    }

    pub fn contains(&self, key: &Value<'_>) -> bool {
        self.find_slot(key).is_some()
    }

    /// Inserts `(key, val)`. Fails (returns `None`) if `key` already exists.
    pub fn add(&mut self, key: Value<'_>, val: V) -> Option<usize> {
        if self.find_slot(&key).is_some() {
            return None;
        }
        Some(self.insert_new(key.into_owned(), val))
    }

    /// Inserts `(key, val)`, replacing any existing value for `key`.
    /// Returns the slot id.
    pub fn update(&mut self, key: Value<'_>, val: V) -> usize {
        if let Some(slot) = self.find_slot(&key) {
            self.entry_mut(slot).expect("slot found by find_slot must exist").val = val;
            return slot;
        }
        self.insert_new(key.into_owned(), val)
    }

    fn insert_new(&mut self, key: Value<'static>, val: V) -> usize {
        let hash = key.hash();
        let bucket = hash as usize & self.mask;

        let slot = match self.free_slots.pop() {
            Some(s) => s,
            None => {
                self.entries.push(None);
                self.entries.len() - 1
            }
        };

        let serial = self.next_serial;
        self.next_serial += 1;

        let next_in_bucket = self.buckets[bucket];
        let prev_live = self.live_tail;

        self.entries[slot] = Some(Entry {
            key,
            val,
            hash,
            serial,
            next_in_bucket,
            prev_live,
            next_live: None,
        });
        self.buckets[bucket] = Some(slot);

        if let Some(tail) = self.live_tail {
            self.entry_mut(tail).expect("live tail must exist").next_live = Some(slot);
        } else {
            self.live_head = Some(slot);
        }
        self.live_tail = Some(slot);

        self.size += 1;
        self.lru[Self::lru_index(hash)] = Some(slot);

        if self.size >= 2 * self.bucket_count() {
            self.resize(self.bucket_count() * 2);
        }

        slot
    }

    pub fn del(&mut self, key: &Value<'_>) -> bool {
        match self.find_slot(key) {
            Some(slot) => {
                self.pos_delete(slot);
                true
            }
            None => false,
        }
    }

    fn resize(&mut self, new_bucket_count: usize) {
        safe_assert!(new_bucket_count.is_power_of_two(), "dict bucket count must be power of two");
        let mut new_buckets = vec![None; new_bucket_count];
        let new_mask = new_bucket_count - 1;

        let mut cur = self.live_head;
        while let Some(slot) = cur {
            let hash = self.entry(slot).expect("live chain entry must exist").hash;
            let bucket = hash as usize & new_mask;
            let head = new_buckets[bucket];
            self.entry_mut(slot).expect("live chain entry must exist").next_in_bucket = head;
            new_buckets[bucket] = Some(slot);
            cur = self.entry(slot).expect("live chain entry must exist").next_live;
        }

        self.buckets = new_buckets;
        self.mask = new_mask;
        self.lru.as_mut_slice().fill(None);
    }

    /// O(1) handle to an entry, stable until that entry is deleted.
    pub fn pos_head(&self) -> Option<usize> {
        self.live_head
    }

    pub fn pos_next(&self, pos: usize) -> Option<usize> {
        self.entry(pos).and_then(|e| e.next_live)
    }

    pub fn pos_get_key(&self, pos: usize) -> Option<&Value<'static>> {
        self.entry(pos).map(|e| &e.key)
    }

    pub fn pos_get_val(&self, pos: usize) -> Option<&V> {
        self.entry(pos).map(|e| &e.val)
    }

    pub fn pos_get_val_mut(&mut self, pos: usize) -> Option<&mut V> {
        self.entry_mut(pos).map(|e| &mut e.val)
    }

    pub fn pos_update(&mut self, pos: usize, val: V) -> bool {
        match self.entry_mut(pos) {
            Some(e) => {
                e.val = val;
                true
            }
            None => false,
        }
    }

    pub fn pos_delete(&mut self, pos: usize) -> bool {
        let Some(entry) = self.entries.get(pos).and_then(|e| e.as_ref()) else {
            return false;
        };
        let hash = entry.hash;
        let prev_live = entry.prev_live;
        let next_live = entry.next_live;

        // Unlink from bucket chain.
        let bucket = hash as usize & self.mask;
        let mut cur = self.buckets[bucket];
        let mut prev_in_bucket: Option<usize> = None;
        while let Some(slot) = cur {
            let next = self.entry(slot).expect("bucket chain entry must exist").next_in_bucket;
            if slot == pos {
                match prev_in_bucket {
                    Some(p) => {
                        self.entry_mut(p).expect("bucket predecessor must exist").next_in_bucket =
                            next;
                    }
                    None => self.buckets[bucket] = next,
                }
                break;
            }
            prev_in_bucket = Some(slot);
            cur = next;
        }

        // Unlink from live chain.
        match prev_live {
            Some(p) => self.entry_mut(p).expect("live predecessor must exist").next_live = next_live,
            None => self.live_head = next_live,
        }
        match next_live {
            Some(n) => self.entry_mut(n).expect("live successor must exist").prev_live = prev_live,
            None => self.live_tail = prev_live,
        }

        let lru_idx = Self::lru_index(hash);
        if self.lru[lru_idx] == Some(pos) {
            self.lru[lru_idx] = None;
        }

        self.entries[pos] = None;
        self.free_slots.push(pos);
        self.size -= 1;
        true
    }
}
