use std::collections::BTreeMap;

/// Releases indexed items strictly in index order, holding early arrivals
/// until everything before them is in.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Hold `item` until its turn. Returns `false` and drops the item if its
    /// index was already released or is already held.
    pub fn insert(&mut self, index: u64, item: T) -> bool {
        if index < self.next || self.pending.contains_key(&index) {
            return false;
        }
        self.pending.insert(index, item);
        true
    }

    /// The item at the cursor, if it has arrived. Advances the cursor.
    pub fn pop_ready(&mut self) -> Option<(u64, T)> {
        let item = self.pending.remove(&self.next)?;
        let index = self.next;
        self.next += 1;
        Some((index, item))
    }

    pub fn next_expected(&self) -> u64 {
        self.next
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Give up on the missing indices and release everything still held, in
    /// index order. The cursor ends past the last released item.
    pub fn drain_remaining(&mut self) -> Vec<(u64, T)> {
        let drained: Vec<(u64, T)> = std::mem::take(&mut self.pending).into_iter().collect();
        if let Some((last, _)) = drained.last() {
            self.next = last + 1;
        }
        drained
    }
}
