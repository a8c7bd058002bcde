//! Top-K selection over a window's key counts.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use toprank_core::{KeyCount, TopKResult};

/// Rank position of a key: a higher count ranks higher, ties go to the smaller key.
#[derive(Debug, PartialEq, Eq)]
struct Candidate<'a> {
    count: u64,
    key: &'a str,
}

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.count
            .cmp(&other.count)
            .then_with(|| other.key.cmp(self.key))
    }
}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Select the `k` best keys, strictly descending by count with ties by ascending key.
///
/// Keeps a min-heap of at most `k` candidates, so ranking `n` keys costs
/// `O(n log k)`. Fewer than `k` keys yields a shorter result; no keys yields
/// an empty one.
pub fn rank<'a, I>(counts: I, k: usize) -> TopKResult
where
    I: IntoIterator<Item = (&'a String, &'a u64)>,
{
    if k == 0 {
        return Vec::new();
    }

    let mut heap: BinaryHeap<Reverse<Candidate<'a>>> = BinaryHeap::with_capacity(k + 1);
    for (key, &count) in counts {
        let candidate = Candidate {
            count,
            key: key.as_str(),
        };
        if heap.len() < k {
            heap.push(Reverse(candidate));
        } else if let Some(Reverse(worst)) = heap.peek() {
            if candidate > *worst {
                heap.pop();
                heap.push(Reverse(candidate));
            }
        }
    }

    let mut ranking = Vec::with_capacity(heap.len());
    while let Some(Reverse(c)) = heap.pop() {
        ranking.push(KeyCount::new(c.key, c.count));
    }
    ranking.reverse();
    ranking
}
