//! Dense hash set of 64-bit record IDs
//!
//! A bucket array of u64 words: an empty bucket is zero, an occupied bucket
//! stores the ID directly. On collision the bucket's high bit is set and the
//! colliding ID moves to an overflow set. Membership is a single array probe
//! for the common case; the overflow set is touched only when a bucket has
//! seen more than one distinct ID.

use ahash::AHashSet;

pub struct IdSet {
    buckets: Vec<u64>,
    trails: AHashSet<u64>,
}

const COLLIDED: u64 = 1 << 63;

impl IdSet {
    /// Create a set with `bnum` buckets.
    pub fn new(bnum: usize) -> Self {
        let bnum = bnum.max(1);
        Self {
            buckets: vec![0; bnum],
            trails: AHashSet::new(),
        }
    }

    /// Mark an ID. IDs must be positive and below 2^63.
    pub fn mark(&mut self, id: u64) {
        debug_assert!(id > 0 && id < COLLIDED);
        let bidx = (id % self.buckets.len() as u64) as usize;
        let rec = self.buckets[bidx];
        if rec == 0 {
            self.buckets[bidx] = id;
        } else {
            if (rec & !COLLIDED) == id {
                return;
            }
            self.buckets[bidx] = rec | COLLIDED;
            self.trails.insert(id);
        }
    }

    /// Check whether an ID is marked.
    pub fn contains(&self, id: u64) -> bool {
        let bidx = (id % self.buckets.len() as u64) as usize;
        let rec = self.buckets[bidx];
        if rec == 0 {
            return false;
        }
        if (rec & !COLLIDED) == id {
            return true;
        }
        if rec & COLLIDED == 0 {
            return false;
        }
        self.trails.contains(&id)
    }

    /// Remove every mark.
    pub fn clear(&mut self) {
        self.buckets.fill(0);
        self.trails.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.trails.is_empty() && self.buckets.iter().all(|&b| b == 0)
    }
}
