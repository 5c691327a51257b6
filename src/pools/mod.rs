//! In-memory cache of not-yet-connected blocks/headers (spec §4.13).
//!
//! The source keeps bidirectional smart-pointer links between an orphan
//! and its predecessor/successor; re-architected here per the Design
//! Notes (§9) as a flat arena keyed by hash plus parent-hash pointers,
//! grounded in the teacher's `forks.rs`/`canonical_chain.rs` block-index-
//! by-hash bookkeeping. Child edges are derived on demand rather than
//! stored, which makes `prune` a single pass over the map instead of a
//! graph walk.

use crate::types::Hash32;
use std::collections::HashMap;

/// Anything that can sit in a pool: headers and full blocks both qualify.
pub trait PoolItem {
    fn item_hash(&self) -> Hash32;
    fn item_previous_hash(&self) -> Hash32;
}

impl PoolItem for crate::types::BlockHeader {
    fn item_hash(&self) -> Hash32 {
        self.hash()
    }
    fn item_previous_hash(&self) -> Hash32 {
        self.previous_hash
    }
}

impl PoolItem for crate::types::Block {
    fn item_hash(&self) -> Hash32 {
        self.hash()
    }
    fn item_previous_hash(&self) -> Hash32 {
        self.header.previous_hash
    }
}

struct Entry<T> {
    item: T,
    height: u32,
}

/// A branch discovered by `get_path`: the persisted fork height plus the
/// pooled items that extend it, oldest first.
pub struct Branch<T> {
    pub fork_height: u32,
    pub items: Vec<T>,
}

/// A hash-keyed cache of blocks or headers not yet on the persisted
/// chain. Used for both the orphan pool and the header-only candidate
/// pool (spec §4.13); which one a given instance serves is determined
/// entirely by the `T` it's instantiated with.
pub struct Pool<T: PoolItem + Clone> {
    entries: HashMap<Hash32, Entry<T>>,
}

impl<T: PoolItem + Clone> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PoolItem + Clone> Pool<T> {
    pub fn new() -> Self {
        Pool { entries: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash32) -> Option<&T> {
        self.entries.get(hash).map(|e| &e.item)
    }

    /// The height an entry would occupy if connected, as recorded at
    /// `add` time.
    pub fn height_of(&self, hash: &Hash32) -> Option<u32> {
        self.entries.get(hash).map(|e| e.height)
    }

    /// Inserts `item` at `height` (the height it would occupy if
    /// connected). Returns `false` without modifying the pool if the
    /// item's hash is already present.
    pub fn add(&mut self, item: T, height: u32) -> bool {
        let hash = item.item_hash();
        if self.entries.contains_key(&hash) {
            return false;
        }
        self.entries.insert(hash, Entry { item, height });
        true
    }

    /// Removes and returns the entry for `hash`, if present.
    pub fn remove(&mut self, hash: &Hash32) -> Option<T> {
        self.entries.remove(hash).map(|e| e.item)
    }

    /// Walks backward from `hash` through the pool's previous-hash
    /// pointers, collecting items, until it reaches a hash not present
    /// in the pool. If that hash resolves via `persisted_height` to a
    /// height on the persistent chain, returns the branch — oldest
    /// first — together with that fork height. If it resolves to
    /// neither the pool nor the persisted chain, `hash` is an orphan and
    /// this returns `None`.
    pub fn get_path(
        &self,
        hash: &Hash32,
        persisted_height: impl Fn(&Hash32) -> Option<u32>,
    ) -> Option<Branch<T>> {
        let mut items = Vec::new();
        let mut current = *hash;
        loop {
            match self.entries.get(&current) {
                Some(entry) => {
                    items.push(entry.item.clone());
                    current = entry.item.item_previous_hash();
                }
                None => break,
            }
        }
        let fork_height = persisted_height(&current)?;
        items.reverse();
        Some(Branch { fork_height, items })
    }

    /// Drops every entry shallower than `top_height - max_depth`
    /// (`max_depth == 0` means unlimited retention — a no-op). A
    /// descendant whose ancestor was just pruned simply becomes
    /// unreachable from any persisted hash until rediscovered by a new
    /// `add`; it is not cascaded away merely because its parent is gone,
    /// which is what lets a surviving subtree "replant" itself as a new
    /// root (spec §8, invariant 10).
    pub fn prune(&mut self, top_height: u32, max_depth: usize) -> usize {
        if max_depth == 0 {
            return 0;
        }
        let threshold = top_height.saturating_sub(max_depth as u32);
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.height >= threshold);
        before - self.entries.len()
    }

    /// Removes every item from `inventory` whose hash (per `hash_of`)
    /// is already present in the pool, leaving non-matching entries (and
    /// entries `hash_of` doesn't recognize as block hashes, e.g.
    /// transaction inventory) untouched.
    pub fn filter_inventory<I>(&self, inventory: &mut Vec<I>, hash_of: impl Fn(&I) -> Option<Hash32>) {
        inventory.retain(|item| match hash_of(item) {
            Some(hash) => !self.contains(&hash),
            None => true,
        });
    }
}
