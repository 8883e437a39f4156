//! Source-identity preservation for DAG cloning.
//!
//! When cloning a pointer graph into a buffer, a shared sub-object must be
//! emitted once and referenced twice, or the clone silently loses identity
//! and can explode in size. A [`Refmap`] remembers which source addresses
//! have already been emitted and what [`Ref`] they produced.
//!
//! This is a map, not a cache: eviction would break identity, so entries are
//! never dropped individually. The source address is only a key; the map
//! never reads through it. Reuse of a source address for different content
//! requires a `reset` first, as does cloning into a nested buffer, because
//! refs cannot be shared with the enclosing buffer.

use crate::refs::Ref;

const MIN_BUCKETS: usize = 8;
/// Grow at 0.7, expressed in integer arithmetic.
const LOAD_NUM: usize = 179;
const LOAD_DEN: usize = 256;
/// Primitive defense against collision attacks on the address hash.
const HASH_SEED: u64 = 0x2f69_3b52;

#[derive(Clone, Copy, Default)]
struct Slot {
    src: usize,
    re: Ref,
}

/// Open-addressed map from source address to builder [`Ref`].
#[derive(Default)]
pub struct Refmap {
    count: usize,
    table: Vec<Slot>,
}

impl Refmap {
    /// The sentinel returned for unmapped sources.
    pub const NOT_FOUND: Ref = Ref::NULL;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// MurmurHash3 64-bit finalizer over the seeded address.
    fn hash(src: usize) -> usize {
        let mut x = src as u64 ^ HASH_SEED;
        x ^= x >> 33;
        x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
        x ^= x >> 33;
        x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
        x ^= x >> 33;
        x as usize
    }

    fn above_load_factor(count: usize, buckets: usize) -> bool {
        count >= buckets * LOAD_NUM / LOAD_DEN
    }

    /// Rebucket for at least `count` entries. Every present entry migrates.
    fn resize(&mut self, count: usize) {
        let count = count.max(self.count);
        let mut buckets = MIN_BUCKETS;
        while Self::above_load_factor(count, buckets) {
            buckets *= 2;
        }
        if self.table.len() == buckets {
            return;
        }
        let old = std::mem::replace(&mut self.table, vec![Slot::default(); buckets]);
        self.count = 0;
        for slot in old {
            if slot.src != 0 {
                self.insert_key(slot.src, slot.re);
            }
        }
    }

    fn insert_key(&mut self, src: usize, re: Ref) -> Ref {
        if src == 0 {
            return re;
        }
        if Self::above_load_factor(self.count, self.table.len()) {
            self.resize(self.count * 2);
        }
        let mask = self.table.len() - 1;
        let k = Self::hash(src);
        for i in 0.. {
            let slot = &mut self.table[(k + i) & mask];
            if slot.src == 0 {
                self.count += 1;
                *slot = Slot { src, re };
                return re;
            }
            if slot.src == src {
                slot.re = re;
                return re;
            }
        }
        unreachable!("load factor keeps the table from filling")
    }

    /// Map `src` to `re`, replacing any previous mapping (newest wins).
    /// Returns `re` for call-chaining; a null `src` is a no-op that still
    /// returns `re`.
    pub fn insert<T>(&mut self, src: *const T, re: Ref) -> Ref {
        self.insert_key(src as usize, re)
    }

    /// The ref previously inserted for `src`, or [`Refmap::NOT_FOUND`].
    pub fn find<T>(&self, src: *const T) -> Ref {
        if self.count == 0 {
            return Self::NOT_FOUND;
        }
        let mask = self.table.len() - 1;
        let k = Self::hash(src as usize);
        for i in 0.. {
            let slot = &self.table[(k + i) & mask];
            if slot.src == 0 {
                return Self::NOT_FOUND;
            }
            if slot.src == src as usize {
                return slot.re;
            }
        }
        unreachable!("load factor keeps the table from filling")
    }

    /// Forget all entries but keep the bucket allocation.
    pub fn reset(&mut self) {
        if self.count > 0 {
            self.table.fill(Slot::default());
        }
        self.count = 0;
    }

    /// Forget all entries and release the bucket allocation.
    pub fn clear(&mut self) {
        self.table = Vec::new();
        self.count = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn find_before_insert_is_not_found() {
        let map = Refmap::new();
        let a = 1u32;
        assert_eq!(map.find(&a), Refmap::NOT_FOUND);
    }

    #[test]
    fn insert_find_round_trip_and_newest_wins() {
        let mut map = Refmap::new();
        let (a, b) = (1u32, 2u32);
        assert_eq!(map.insert(&a, Ref(-42)), Ref(-42));
        assert_eq!(map.find(&a), Ref(-42));
        assert_eq!(map.find(&b), Refmap::NOT_FOUND);
        assert_eq!(map.len(), 1);

        map.insert(&a, Ref(-43));
        assert_eq!(map.find(&a), Ref(-43));
        assert_eq!(map.len(), 1);

        map.insert(&b, Ref(-10));
        assert_eq!(map.find(&b), Ref(-10));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn null_src_is_a_pass_through() {
        let mut map = Refmap::new();
        assert_eq!(map.insert(std::ptr::null::<u8>(), Ref(-7)), Ref(-7));
        assert_eq!(map.find(std::ptr::null::<u8>()), Refmap::NOT_FOUND);
        assert!(map.is_empty());
    }

    #[test]
    fn resize_preserves_all_entries() {
        let mut map = Refmap::new();
        let data = [0i32; 1000];
        for (i, item) in data.iter().enumerate() {
            map.insert(item, Ref(-(i as i32) - 1));
        }
        assert_eq!(map.len(), 1000);
        for (i, item) in data.iter().enumerate() {
            assert_eq!(map.find(item), Ref(-(i as i32) - 1));
        }
    }

    #[test]
    fn reset_keeps_buckets_clear_releases() {
        let mut map = Refmap::new();
        let a = 5u64;
        map.insert(&a, Ref(-1));
        map.reset();
        assert_eq!(map.len(), 0);
        assert_eq!(map.find(&a), Refmap::NOT_FOUND);
        assert!(!map.table.is_empty());

        map.insert(&a, Ref(-2));
        map.clear();
        assert_eq!(map.len(), 0);
        assert!(map.table.is_empty());
        // Usable again after clear.
        assert_eq!(map.insert(&a, Ref(-3)), Ref(-3));
        assert_eq!(map.find(&a), Ref(-3));
    }
}
