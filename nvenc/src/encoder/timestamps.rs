use slot_ring::SlotRing;

/// Presentation timestamps of the frames in flight, oldest first.
#[derive(Debug)]
pub(crate) struct TimestampQueue {
    ring: SlotRing<i64>,
}

impl TimestampQueue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        TimestampQueue {
            ring: SlotRing::from_fn(capacity, |_| 0),
        }
    }

    /// Returns `false` if the queue is full.
    #[inline]
    pub(crate) fn push(&mut self, pts: i64) -> bool {
        self.ring.push(pts).is_ok()
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Option<i64> {
        self.ring.pop()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_within_capacity() {
        let mut queue = TimestampQueue::with_capacity(3);
        assert!(queue.push(10));
        assert!(queue.push(20));
        assert!(queue.push(30));
        assert!(!queue.push(40));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop(), Some(10));
        assert!(queue.push(40));
        assert_eq!(queue.pop(), Some(20));
        assert_eq!(queue.pop(), Some(30));
        assert_eq!(queue.pop(), Some(40));
        assert_eq!(queue.pop(), None);
    }
}
