use std::ops::{Deref, DerefMut};

/// A bounded ring over a fixed set of items.
///
/// The storage is allocated once and the items stay in place for the lifetime of the ring. The
/// writer and the reader each own a cursor (`head` and `tail`) that walks the storage in order
/// and wraps around at the end; `len` counts the items that were written but not read yet.
/// This behaves like a queue in that an item must be written before it can be read and cannot
/// be read again until after the next write to it.
///
/// Unlike a channel, nothing here is synchronized: the ring is driven from a single thread and
/// `&mut self` guarantees exclusive access.
#[derive(Debug)]
pub struct SlotRing<T> {
    /// Index of the next item to be written
    head: usize,
    /// Index of the next item to be read
    tail: usize,
    /// Number of items written but not yet read
    len: usize,
    /// Array that holds the items
    items: Box<[T]>,
}

impl<T> SlotRing<T> {
    /// Creates a ring whose storage is `items`. The capacity is `items.len()`.
    pub fn from_items(items: Vec<T>) -> Self {
        SlotRing {
            head: 0,
            tail: 0,
            len: 0,
            items: items.into_boxed_slice(),
        }
    }

    /// Creates a ring of `capacity` items produced by `f`.
    pub fn from_fn<F>(capacity: usize, f: F) -> Self
    where
        F: FnMut(usize) -> T,
    {
        SlotRing::from_items((0..capacity).map(f).collect())
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    /// Number of items written but not yet read.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.items.len()
    }

    /// Index of the item the next write goes to.
    #[inline]
    pub fn head(&self) -> usize {
        self.head
    }

    /// Index of the item the next read comes from.
    #[inline]
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Returns the next item to be written to. `None` if the ring is full.
    ///
    /// The write only takes effect once [`WriterItem::commit`] is called; dropping the item
    /// leaves the cursors untouched so the same item is handed out again.
    pub fn writer_item(&mut self) -> Option<WriterItem<'_, T>> {
        if self.is_full() {
            return None;
        }
        let index = self.head;
        Some(WriterItem { ring: self, index })
    }

    /// Returns the next item to be read from. `None` if the ring is empty.
    ///
    /// The item goes back to the writer once [`ReaderItem::release`] is called.
    pub fn reader_item(&mut self) -> Option<ReaderItem<'_, T>> {
        if self.is_empty() {
            return None;
        }
        let index = self.tail;
        Some(ReaderItem { ring: self, index })
    }

    /// Overwrites the next item with `item`. Gives `item` back if the ring is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        match self.writer_item() {
            Some(mut slot) => {
                *slot = item;
                slot.commit();
                Ok(())
            }
            None => Err(item),
        }
    }

    /// Takes the oldest unread item, leaving `T::default()` in its place.
    pub fn pop(&mut self) -> Option<T>
    where
        T: Default,
    {
        let mut slot = self.reader_item()?;
        let item = std::mem::take(&mut *slot);
        slot.release();
        Some(item)
    }

    /// Iterates over the whole storage in index order, regardless of the cursors.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Mutable iteration over the whole storage in index order, regardless of the cursors.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    /// Maps `index + 1` to [0, capacity).
    #[inline]
    fn next_index(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.items.len() {
            0
        } else {
            next
        }
    }
}

/// Represents the item to be written to.
pub struct WriterItem<'a, T> {
    ring: &'a mut SlotRing<T>,
    index: usize,
}

impl<'a, T> WriterItem<'a, T> {
    /// Position of the item in the storage.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Passes the item to the reader and moves the writer to the next item.
    pub fn commit(self) {
        let ring = self.ring;
        ring.head = ring.next_index(self.index);
        ring.len += 1;
    }
}

impl<'a, T> Deref for WriterItem<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.ring.items[self.index]
    }
}

impl<'a, T> DerefMut for WriterItem<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ring.items[self.index]
    }
}

/// Represents the item to be read from.
pub struct ReaderItem<'a, T> {
    ring: &'a mut SlotRing<T>,
    index: usize,
}

impl<'a, T> ReaderItem<'a, T> {
    /// Position of the item in the storage.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Passes the item back to be reused by the writer and moves the reader to the next item.
    pub fn release(self) {
        let ring = self.ring;
        ring.tail = ring.next_index(self.index);
        ring.len -= 1;
    }
}

impl<'a, T> Deref for ReaderItem<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.ring.items[self.index]
    }
}

impl<'a, T> DerefMut for ReaderItem<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ring.items[self.index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{
        distributions::{Distribution, Uniform},
        rngs::StdRng,
        SeedableRng,
    };
    use std::collections::VecDeque;

    #[test]
    fn fifo_order_with_wrap_around() {
        let mut ring = SlotRing::from_items(vec![0i64; 3]);
        for round in 0..5 {
            ring.push(round * 10).unwrap();
            ring.push(round * 10 + 1).unwrap();
            assert_eq!(ring.pop(), Some(round * 10));
            assert_eq!(ring.pop(), Some(round * 10 + 1));
            assert!(ring.is_empty());
        }
        // 10 writes and 10 reads on a ring of 3
        assert_eq!(ring.head(), 1);
        assert_eq!(ring.tail(), 1);
    }

    #[test]
    fn full_and_empty() {
        let mut ring = SlotRing::from_fn(2, |_| 0u32);
        assert!(ring.reader_item().is_none());
        assert_eq!(ring.pop(), None);

        ring.push(1).unwrap();
        ring.push(2).unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.push(3), Err(3));
        assert!(ring.writer_item().is_none());

        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.len(), 1);
        assert!(ring.writer_item().is_some());
    }

    #[test]
    fn uncommitted_write_is_not_visible() {
        let mut ring = SlotRing::from_fn(4, |i| i);
        {
            let mut item = ring.writer_item().unwrap();
            assert_eq!(item.index(), 0);
            *item = 42;
        }
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.head(), 0);

        // Same item is handed out again and keeps what was written to it
        let item = ring.writer_item().unwrap();
        assert_eq!(item.index(), 0);
        assert_eq!(*item, 42);
        item.commit();
        assert_eq!(ring.head(), 1);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn items_stay_in_place() {
        let mut ring = SlotRing::from_fn(3, |i| format!("slot-{i}"));
        for expected in [0, 1, 2, 0, 1] {
            let item = ring.writer_item().unwrap();
            assert_eq!(item.index(), expected);
            assert_eq!(*item, format!("slot-{expected}"));
            item.commit();

            let item = ring.reader_item().unwrap();
            assert_eq!(item.index(), expected);
            item.release();
        }
        let names: Vec<_> = ring.iter().cloned().collect();
        assert_eq!(names, ["slot-0", "slot-1", "slot-2"]);
    }

    #[test]
    fn zero_capacity() {
        let mut ring: SlotRing<u8> = SlotRing::from_items(Vec::new());
        assert!(ring.is_empty());
        assert!(ring.is_full());
        assert_eq!(ring.push(1), Err(1));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn matches_vec_deque() {
        const CAPACITY: usize = 7;
        const ITERS: usize = 10_000;

        let mut rng = StdRng::seed_from_u64(0);
        let coin = Uniform::from(0..3);

        let mut ring = SlotRing::from_items(vec![0usize; CAPACITY]);
        let mut model = VecDeque::new();

        for i in 0..ITERS {
            // Bias towards writes so the ring spends time being full
            if coin.sample(&mut rng) < 2 {
                let pushed = ring.push(i).is_ok();
                assert_eq!(pushed, model.len() < CAPACITY);
                if pushed {
                    model.push_back(i);
                }
            } else {
                assert_eq!(ring.pop(), model.pop_front());
            }
            assert_eq!(ring.len(), model.len());
            assert!(ring.len() <= ring.capacity());
            assert_eq!((ring.tail() + ring.len()) % CAPACITY, ring.head());
        }
    }
}
