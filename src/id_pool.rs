use std::collections::BTreeSet;

/// Allocator for small user ids. Always hands out the smallest id in
/// `min..=max` that is not currently in use.
#[derive(Debug, Clone)]
pub struct IdPool {
    min: u32,
    max: u32,
    in_use: BTreeSet<u32>,
}

impl IdPool {
    pub fn new(min: u32, max: u32) -> Self {
        Self {
            min,
            max,
            in_use: BTreeSet::new(),
        }
    }

    /// Take the smallest idle id, or `None` when the pool is exhausted.
    pub fn acquire(&mut self) -> Option<u32> {
        let mut candidate = self.min;
        // in_use iterates in ascending order, so the first gap is the answer.
        for &id in self.in_use.range(self.min..=self.max) {
            if id != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate > self.max {
            return None;
        }
        self.in_use.insert(candidate);
        Some(candidate)
    }

    /// Return an id to the pool. Releasing an id that is not held is a no-op,
    /// so a double release can never free an id someone else now owns.
    pub fn release(&mut self, id: u32) -> bool {
        self.in_use.remove(&id)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}
