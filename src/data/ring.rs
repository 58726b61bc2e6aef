//! Ready and done queues over buffer indices.
//!
//! Both queues are doubly linked lists threaded through one link array indexed
//! by buffer index, so every relink is O(1) and allocation free. Each slot
//! records which queue it currently sits on, which makes "at most one queue per
//! buffer" a checked property rather than a convention.
//!
//! `Ring` has no interior locking; the device keeps it behind a single short
//! mutex.

use serde::Serialize;

/// Which of the two queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Submitted to hardware, waiting to be filled.
    Ready,
    /// Filled by hardware, waiting to be consumed.
    Done,
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    queue: Option<QueueKind>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ends {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// Two disjoint FIFO queues over `0..capacity`.
#[derive(Debug, Default)]
pub struct Ring {
    links: Vec<Link>,
    ready: Ends,
    done: Ends,
}

impl Ring {
    /// Empty ring with no slots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indices the ring can track.
    pub fn capacity(&self) -> usize {
        self.links.len()
    }

    /// Grows the link array; existing membership is untouched.
    pub fn grow_to(&mut self, capacity: usize) {
        if capacity > self.links.len() {
            self.links.resize(capacity, Link::default());
        }
    }

    /// Empties both queues and forgets every index.
    pub fn clear(&mut self) {
        self.links.clear();
        self.ready = Ends::default();
        self.done = Ends::default();
    }

    /// Entries on `kind`.
    pub fn len(&self, kind: QueueKind) -> usize {
        self.ends(kind).len
    }

    /// Whether `kind` has no entries.
    pub fn is_empty(&self, kind: QueueKind) -> bool {
        self.ends(kind).len == 0
    }

    /// Queue currently holding `index`.
    pub fn membership(&self, index: usize) -> Option<QueueKind> {
        self.links.get(index).and_then(|l| l.queue)
    }

    /// Appends `index` to the tail of `kind`.
    ///
    /// Fails with the queue the index already sits on; an index beyond
    /// `capacity` is reported as `None`.
    pub fn push_back(&mut self, kind: QueueKind, index: usize) -> Result<(), Option<QueueKind>> {
        let link = self.links.get(index).ok_or(None)?;
        if let Some(current) = link.queue {
            return Err(Some(current));
        }

        let old_tail = self.ends(kind).tail;
        self.links[index] = Link {
            prev: old_tail,
            next: None,
            queue: Some(kind),
        };
        match old_tail {
            Some(t) => self.links[t].next = Some(index),
            None => self.ends_mut(kind).head = Some(index),
        }
        let ends = self.ends_mut(kind);
        ends.tail = Some(index);
        ends.len += 1;
        Ok(())
    }

    /// Unlinks and returns the head of `kind`.
    pub fn pop_front(&mut self, kind: QueueKind) -> Option<usize> {
        let index = self.ends(kind).head?;
        let next = self.links[index].next;
        self.links[index] = Link::default();

        match next {
            Some(n) => self.links[n].prev = None,
            None => self.ends_mut(kind).tail = None,
        }
        let ends = self.ends_mut(kind);
        ends.head = next;
        ends.len -= 1;
        Some(index)
    }

    /// Moves the ready head to the done tail; the interrupt-side transition.
    pub fn promote(&mut self) -> Option<usize> {
        let index = self.pop_front(QueueKind::Ready)?;
        // Just unlinked, so it cannot already be on a queue.
        let _ = self.push_back(QueueKind::Done, index);
        Some(index)
    }

    /// Unlinks every entry of `kind`, returning them in queue order.
    pub fn drain(&mut self, kind: QueueKind) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len(kind));
        while let Some(i) = self.pop_front(kind) {
            out.push(i);
        }
        out
    }

    /// Indices on `kind`, head first.
    pub fn snapshot(&self, kind: QueueKind) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len(kind));
        let mut cursor = self.ends(kind).head;
        while let Some(i) = cursor {
            out.push(i);
            cursor = self.links[i].next;
        }
        out
    }

    fn ends(&self, kind: QueueKind) -> &Ends {
        match kind {
            QueueKind::Ready => &self.ready,
            QueueKind::Done => &self.done,
        }
    }

    fn ends_mut(&mut self, kind: QueueKind) -> &mut Ends {
        match kind {
            QueueKind::Ready => &mut self.ready,
            QueueKind::Done => &mut self.done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> Ring {
        let mut r = Ring::new();
        r.grow_to(capacity);
        r
    }

    #[test]
    fn test_fifo_order() {
        let mut r = ring(5);
        for i in [3, 1, 4] {
            r.push_back(QueueKind::Ready, i).unwrap();
        }
        assert_eq!(r.snapshot(QueueKind::Ready), vec![3, 1, 4]);
        assert_eq!(r.pop_front(QueueKind::Ready), Some(3));
        assert_eq!(r.pop_front(QueueKind::Ready), Some(1));
        assert_eq!(r.pop_front(QueueKind::Ready), Some(4));
        assert_eq!(r.pop_front(QueueKind::Ready), None);
        assert!(r.is_empty(QueueKind::Ready));
    }

    #[test]
    fn test_promote_preserves_order() {
        let mut r = ring(4);
        for i in [2, 0, 3] {
            r.push_back(QueueKind::Ready, i).unwrap();
        }
        assert_eq!(r.promote(), Some(2));
        assert_eq!(r.promote(), Some(0));
        assert_eq!(r.snapshot(QueueKind::Ready), vec![3]);
        assert_eq!(r.snapshot(QueueKind::Done), vec![2, 0]);
        assert_eq!(r.membership(0), Some(QueueKind::Done));
        assert_eq!(r.membership(1), None);
    }

    #[test]
    fn test_rejects_double_queue() {
        let mut r = ring(2);
        r.push_back(QueueKind::Ready, 1).unwrap();
        assert_eq!(
            r.push_back(QueueKind::Ready, 1),
            Err(Some(QueueKind::Ready))
        );
        r.promote();
        assert_eq!(r.push_back(QueueKind::Ready, 1), Err(Some(QueueKind::Done)));
        assert_eq!(r.push_back(QueueKind::Ready, 2), Err(None));
        assert_eq!(r.len(QueueKind::Ready), 0);
        assert_eq!(r.len(QueueKind::Done), 1);
    }

    #[test]
    fn test_requeue_after_pop() {
        let mut r = ring(3);
        r.push_back(QueueKind::Done, 0).unwrap();
        r.push_back(QueueKind::Done, 1).unwrap();
        assert_eq!(r.pop_front(QueueKind::Done), Some(0));
        r.push_back(QueueKind::Ready, 0).unwrap();
        r.push_back(QueueKind::Done, 2).unwrap();
        assert_eq!(r.snapshot(QueueKind::Done), vec![1, 2]);
        assert_eq!(r.snapshot(QueueKind::Ready), vec![0]);
    }

    #[test]
    fn test_drain_and_clear() {
        let mut r = ring(4);
        for i in 0..4 {
            r.push_back(QueueKind::Ready, i).unwrap();
        }
        assert_eq!(r.drain(QueueKind::Ready), vec![0, 1, 2, 3]);
        assert!(r.is_empty(QueueKind::Ready));
        r.push_back(QueueKind::Done, 1).unwrap();
        r.clear();
        assert_eq!(r.capacity(), 0);
        assert!(r.is_empty(QueueKind::Done));
    }
}
