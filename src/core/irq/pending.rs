//! Pending interrupt queue
//!
//! Vectors that assert while another vector is being serviced wait here,
//! ordered by priority. The head is always the most urgent pending vector.
//! Equal priorities are served first-come first-served: a new entry is placed
//! after every queued entry of the same priority.
//!
//! A vector is queued at most once. Membership is tracked in a bitmask with
//! one bit per vector (`1 << irq`), so re-latching a pending vector is a
//! no-op and does not move it.

use heapless::Vec;

use crate::config::IRQ_VECTORS_COUNT;
use crate::types::{Irq, Priority};

/// Priority-ordered set of latched vectors
pub struct PendingQueue {
    list: Vec<Irq, IRQ_VECTORS_COUNT>,
    mask: u32,
}

impl PendingQueue {
    pub const fn new() -> Self {
        PendingQueue {
            list: Vec::new(),
            mask: 0,
        }
    }

    /// Queue `irq` behind every entry of equal or higher urgency
    ///
    /// Returns `false` if it was already pending.
    pub fn push(&mut self, irq: Irq, priorities: &[Priority; IRQ_VECTORS_COUNT]) -> bool {
        if self.mask & irq.mask() != 0 {
            return false;
        }
        let prio = priorities[irq.index()];
        let pos = self
            .list
            .iter()
            .position(|p| priorities[p.index()] > prio)
            .unwrap_or(self.list.len());
        // Capacity equals the number of vectors and the mask rules out
        // duplicates, so the list cannot be full here.
        if self.list.insert(pos, irq).is_err() {
            return false;
        }
        self.mask |= irq.mask();
        true
    }

    /// Remove and return the most urgent pending vector
    pub fn pop(&mut self) -> Option<Irq> {
        if self.list.is_empty() {
            return None;
        }
        let irq = self.list.remove(0);
        self.mask &= !irq.mask();
        Some(irq)
    }

    /// Drop `irq` from the queue. Returns `true` if it was pending.
    pub fn remove(&mut self, irq: Irq) -> bool {
        if self.mask & irq.mask() == 0 {
            return false;
        }
        if let Some(pos) = self.list.iter().position(|&p| p == irq) {
            self.list.remove(pos);
        }
        self.mask &= !irq.mask();
        true
    }

    /// Most urgent pending vector, without removing it
    #[inline]
    pub fn peek(&self) -> Option<Irq> {
        self.list.first().copied()
    }

    #[inline]
    pub fn contains(&self, irq: Irq) -> bool {
        self.mask & irq.mask() != 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Pending vectors, most urgent first
    pub fn iter(&self) -> impl Iterator<Item = Irq> + '_ {
        self.list.iter().copied()
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IRQ_LOWEST_PRIORITY;

    fn irq(n: u8) -> Irq {
        Irq::new(n).unwrap()
    }

    fn prios(pairs: &[(u8, Priority)]) -> [Priority; IRQ_VECTORS_COUNT] {
        let mut p = [IRQ_LOWEST_PRIORITY; IRQ_VECTORS_COUNT];
        for &(n, prio) in pairs {
            p[n as usize] = prio;
        }
        p
    }

    #[test]
    fn test_pops_by_priority() {
        let p = prios(&[(4, 9), (7, 1), (2, 5)]);
        let mut q = PendingQueue::new();
        q.push(irq(4), &p);
        q.push(irq(7), &p);
        q.push(irq(2), &p);
        assert_eq!(q.pop(), Some(irq(7)));
        assert_eq!(q.pop(), Some(irq(2)));
        assert_eq!(q.pop(), Some(irq(4)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let p = prios(&[(10, 3), (3, 3), (20, 3)]);
        let mut q = PendingQueue::new();
        q.push(irq(10), &p);
        q.push(irq(3), &p);
        q.push(irq(20), &p);
        assert_eq!(q.iter().collect::<std::vec::Vec<_>>(), [irq(10), irq(3), irq(20)]);
    }

    #[test]
    fn test_duplicate_push_keeps_position() {
        let p = prios(&[(1, 2), (5, 2)]);
        let mut q = PendingQueue::new();
        assert!(q.push(irq(1), &p));
        assert!(q.push(irq(5), &p));
        assert!(!q.push(irq(1), &p));
        assert_eq!(q.len(), 2);
        assert_eq!(q.peek(), Some(irq(1)));
    }

    #[test]
    fn test_overlapping_bit_patterns_are_distinct() {
        // 3 = 0b11 shares bits with 1 and 2; each must still queue once.
        let p = prios(&[]);
        let mut q = PendingQueue::new();
        assert!(q.push(irq(3), &p));
        assert!(q.push(irq(1), &p));
        assert!(q.push(irq(2), &p));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_remove() {
        let p = prios(&[]);
        let mut q = PendingQueue::new();
        q.push(irq(8), &p);
        q.push(irq(9), &p);
        assert!(q.remove(irq(8)));
        assert!(!q.remove(irq(8)));
        assert!(!q.contains(irq(8)));
        assert_eq!(q.pop(), Some(irq(9)));
        assert!(q.is_empty());
    }
}
