//! Slab-backed run queue
//!
//! A doubly linked list whose nodes live in a `Vec`, linked by index, with
//! slot 0 acting as the sentinel. Freed slots are recycled through a free
//! list. Callers keep the slot returned by [`RunQueue::insert_before`] to
//! unlink an entry in O(1).

use std::collections::TryReserveError;

/// Sentinel slot. Inserting before it appends at the tail.
pub const HEAD: usize = 0;

#[derive(Debug)]
struct Node<T> {
    prev: usize,
    next: usize,
    item: Option<T>,
}

#[derive(Debug)]
pub struct RunQueue<T> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Default for RunQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RunQueue<T> {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                prev: HEAD,
                next: HEAD,
                item: None,
            }],
            free: Vec::new(),
            len: 0,
        }
    }

    /// Empty queue with room for `capacity` entries
    pub fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut rq = Self::new();
        rq.nodes.try_reserve(capacity)?;
        rq.free.try_reserve(capacity)?;
        Ok(rq)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<&T> {
        self.get(self.first_slot())
    }

    /// Slot of the first entry, `HEAD` when empty
    pub fn first_slot(&self) -> usize {
        self.nodes[HEAD].next
    }

    /// Slot following `slot`, `HEAD` past the tail
    pub fn next_slot(&self, slot: usize) -> usize {
        self.nodes[slot].next
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.nodes.get(slot).and_then(|n| n.item.as_ref())
    }

    /// Link `item` in front of `pos` and return its slot.
    pub fn insert_before(&mut self, pos: usize, item: T) -> usize {
        assert!(
            pos == HEAD || self.get(pos).is_some(),
            "run queue insert before a free slot {}",
            pos
        );
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot].item = Some(item);
                slot
            }
            None => {
                self.nodes.push(Node {
                    prev: HEAD,
                    next: HEAD,
                    item: Some(item),
                });
                self.nodes.len() - 1
            }
        };
        let prev = self.nodes[pos].prev;
        self.link_between(slot, prev, pos);
        self.len += 1;
        slot
    }

    pub fn push_back(&mut self, item: T) -> usize {
        self.insert_before(HEAD, item)
    }

    /// Unlink the entry at `slot`.
    ///
    /// # Panics
    ///
    /// If `slot` does not hold an entry.
    pub fn remove(&mut self, slot: usize) -> T {
        let item = match self.nodes.get_mut(slot).and_then(|n| n.item.take()) {
            Some(item) => item,
            None => panic!("run queue remove of unlinked slot {}", slot),
        };
        self.unlink(slot);
        self.free.push(slot);
        self.len -= 1;
        item
    }

    /// Stable O(n) partition: entries matching `to_front` move ahead of the
    /// others, keeping relative order within both groups. Returns how many
    /// entries moved.
    pub fn partition_front<F: FnMut(&T) -> bool>(&mut self, mut to_front: F) -> usize {
        let mut moved = 0;
        let mut last_front = HEAD;
        let mut cur = self.first_slot();
        while cur != HEAD {
            let next = self.nodes[cur].next;
            let matches = self.nodes[cur].item.as_ref().map_or(false, &mut to_front);
            if matches {
                if self.nodes[cur].prev != last_front {
                    self.unlink(cur);
                    let after = self.nodes[last_front].next;
                    self.link_between(cur, last_front, after);
                    moved += 1;
                }
                last_front = cur;
            }
            cur = next;
        }
        moved
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            rq: self,
            slot: self.first_slot(),
        }
    }

    fn link_between(&mut self, slot: usize, prev: usize, next: usize) {
        self.nodes[slot].prev = prev;
        self.nodes[slot].next = next;
        self.nodes[prev].next = slot;
        self.nodes[next].prev = slot;
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[slot].prev = slot;
        self.nodes[slot].next = slot;
    }
}

/// Iterates `(slot, entry)` from head to tail
pub struct Iter<'a, T> {
    rq: &'a RunQueue<T>,
    slot: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.slot == HEAD {
            return None;
        }
        let slot = self.slot;
        let node = &self.rq.nodes[slot];
        self.slot = node.next;
        node.item.as_ref().map(|item| (slot, item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(rq: &RunQueue<i32>) -> Vec<i32> {
        rq.iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn test_insert_before_and_remove() {
        let mut rq = RunQueue::new();
        let a = rq.push_back(1);
        let c = rq.push_back(3);
        let b = rq.insert_before(c, 2);
        rq.insert_before(a, 0);
        assert_eq!(items(&rq), vec![0, 1, 2, 3]);
        assert_eq!(rq.remove(b), 2);
        assert_eq!(items(&rq), vec![0, 1, 3]);
        assert_eq!(rq.len(), 3);
        assert_eq!(rq.front(), Some(&0));
    }

    #[test]
    fn test_slots_are_recycled() {
        let mut rq = RunQueue::new();
        let a = rq.push_back(1);
        rq.push_back(2);
        rq.remove(a);
        let again = rq.push_back(3);
        assert_eq!(a, again);
        assert_eq!(items(&rq), vec![2, 3]);
    }

    #[test]
    #[should_panic(expected = "unlinked slot")]
    fn test_double_remove_panics() {
        let mut rq = RunQueue::new();
        let a = rq.push_back(1);
        rq.remove(a);
        rq.remove(a);
    }

    #[test]
    fn test_partition_is_stable() {
        let mut rq = RunQueue::new();
        for v in [1, 10, 2, 11, 3, 12] {
            rq.push_back(v);
        }
        let moved = rq.partition_front(|v| *v >= 10);
        assert_eq!(items(&rq), vec![10, 11, 12, 1, 2, 3]);
        assert_eq!(moved, 3);
        // Already partitioned: nothing moves
        assert_eq!(rq.partition_front(|v| *v >= 10), 0);
        assert_eq!(items(&rq), vec![10, 11, 12, 1, 2, 3]);
    }

    #[test]
    fn test_iteration_over_empty_queue() {
        let rq: RunQueue<i32> = RunQueue::try_with_capacity(8).unwrap();
        assert!(rq.is_empty());
        assert_eq!(rq.first_slot(), HEAD);
        assert!(rq.iter().next().is_none());
    }
}
