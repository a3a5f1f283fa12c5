//! Result-set algebra over ID arrays
//!
//! Per-shard searches produce unsorted ID arrays; compound queries combine
//! them. Union sorts and deduplicates a concatenation; the two-set intersect
//! hash-joins through the smaller side; the N-way intersect sorts once and
//! keeps IDs whose run length equals the set count; difference marks the
//! subtrahends in an ID set and filters the minuend.

use super::idset::IdSet;

const HASH_JOIN_CO: usize = 4;

/// Union of result sets, sorted ascending and deduplicated.
pub fn union(sets: &[Vec<u64>]) -> Vec<u64> {
    if sets.is_empty() {
        return Vec::new();
    }
    if sets.len() == 1 {
        return sets[0].clone();
    }
    let sum: usize = sets.iter().map(Vec::len).sum();
    let mut res = Vec::with_capacity(sum);
    for set in sets {
        res.extend_from_slice(set);
    }
    res.sort_unstable();
    res.dedup();
    res
}

/// Intersection of result sets.
pub fn intersect(sets: &[Vec<u64>]) -> Vec<u64> {
    if sets.is_empty() {
        return Vec::new();
    }
    if sets.len() == 1 {
        return sets[0].clone();
    }
    if sets.len() == 2 {
        let (small, large) = if sets[0].len() < sets[1].len() {
            (&sets[0], &sets[1])
        } else {
            (&sets[1], &sets[0])
        };
        let mut idset = IdSet::new(small.len() * HASH_JOIN_CO + 1);
        for &id in small.iter() {
            idset.mark(id);
        }
        let mut res = Vec::with_capacity(small.len());
        for &id in large.iter() {
            if idset.contains(id) {
                res.push(id);
                if res.len() >= small.len() {
                    break;
                }
            }
        }
        return res;
    }
    let sum: usize = sets.iter().map(Vec::len).sum();
    let mut all = Vec::with_capacity(sum);
    for set in sets {
        all.extend_from_slice(set);
    }
    all.sort_unstable();
    let mut res = Vec::new();
    let mut run = 0usize;
    let mut last = u64::MAX;
    for &id in &all {
        if id == last {
            run += 1;
            if run == sets.len() {
                res.push(id);
            }
        } else {
            run = 1;
            last = id;
        }
    }
    res
}

/// IDs of the first set with every ID of the remaining sets removed.
pub fn difference(sets: &[Vec<u64>]) -> Vec<u64> {
    if sets.is_empty() {
        return Vec::new();
    }
    if sets.len() == 1 {
        return sets[0].clone();
    }
    let sum: usize = sets[1..].iter().map(Vec::len).sum();
    let mut idset = IdSet::new(sum * HASH_JOIN_CO + 1);
    for set in &sets[1..] {
        for &id in set.iter() {
            idset.mark(id);
        }
    }
    sets[0]
        .iter()
        .copied()
        .filter(|&id| !idset.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union() {
        assert_eq!(union(&[]), Vec::<u64>::new());
        assert_eq!(union(&[vec![3, 1, 2]]), vec![3, 1, 2]);
        assert_eq!(union(&[vec![3, 1], vec![2, 3], vec![4]]), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_intersect_two() {
        assert_eq!(intersect(&[vec![1, 2, 3, 4], vec![3, 4, 5]]), vec![3, 4]);
        assert_eq!(intersect(&[vec![1, 2], vec![3]]), Vec::<u64>::new());
    }

    #[test]
    fn test_intersect_many() {
        let sets = vec![vec![1, 2, 3, 4], vec![2, 3, 4, 5], vec![3, 4, 6]];
        assert_eq!(intersect(&sets), vec![3, 4]);
    }

    #[test]
    fn test_intersect_empty_member() {
        assert_eq!(intersect(&[vec![1, 2], vec![]]), Vec::<u64>::new());
    }

    #[test]
    fn test_difference() {
        assert_eq!(difference(&[vec![1, 2, 3, 4], vec![2], vec![4]]), vec![1, 3]);
        assert_eq!(difference(&[vec![1, 2], vec![5]]), vec![1, 2]);
        assert_eq!(difference(&[]), Vec::<u64>::new());
    }

    #[test]
    fn test_algebra_is_set_correct() {
        use std::collections::BTreeSet;
        let a = vec![9u64, 1, 5, 7, 3];
        let b = vec![5u64, 7, 2, 8];
        let sa: BTreeSet<u64> = a.iter().copied().collect();
        let sb: BTreeSet<u64> = b.iter().copied().collect();

        let u: BTreeSet<u64> = union(&[a.clone(), b.clone()]).into_iter().collect();
        assert_eq!(u, sa.union(&sb).copied().collect());

        let i: BTreeSet<u64> = intersect(&[a.clone(), b.clone()]).into_iter().collect();
        assert_eq!(i, sa.intersection(&sb).copied().collect());

        let d: BTreeSet<u64> = difference(&[a, b]).into_iter().collect();
        assert_eq!(d, sa.difference(&sb).copied().collect());
    }
}
