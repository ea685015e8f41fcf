use crate::error::BufferError;

/// Fixed-capacity ring buffer that evicts its oldest entry when full
///
/// Index 0 always addresses the oldest retained entry and `len() - 1` the
/// newest. Not synchronized; the live view serializes access to it.
#[derive(Clone, Debug)]
pub struct RingBuffer<T> {
    /// Slot storage, `None` when vacant
    slots: Vec<Option<T>>,

    /// Slot holding the oldest entry
    tail: usize,

    /// Slot the next entry is written to
    head: usize,

    /// Number of occupied slots
    len: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer holding at most `capacity` entries
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Ok(Self {
            slots,
            tail: 0,
            head: 0,
            len: 0,
        })
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// Insert at the head, returning the evicted oldest entry if the buffer
    /// was full
    pub fn put(&mut self, item: T) -> Option<T> {
        let evicted = self.slots[self.head].replace(item);
        self.head = self.advance(self.head);

        if self.is_full() {
            // the slot we just overwrote was the tail
            self.tail = self.advance(self.tail);
        } else {
            self.len += 1;
        }

        evicted
    }

    /// Entry at `index`, where 0 is the oldest
    pub fn get(&self, index: usize) -> Result<&T, BufferError> {
        if index >= self.len {
            return Err(BufferError::OutOfRange {
                index,
                len: self.len,
            });
        }

        let mut slot = self.tail + index;
        if slot >= self.slots.len() {
            slot -= self.slots.len();
        }

        self.slots[slot].as_ref().ok_or(BufferError::OutOfRange {
            index,
            len: self.len,
        })
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.get(i).ok())
    }

    /// Drop all entries, releasing their references
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }

    fn advance(&self, slot: usize) -> usize {
        if slot + 1 == self.slots.len() { 0 } else { slot + 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::rc::Rc;

    fn filled(capacity: usize, count: usize) -> RingBuffer<usize> {
        let mut buffer = RingBuffer::new(capacity).unwrap();
        for i in 0..count {
            buffer.put(i);
        }
        buffer
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(RingBuffer::<u8>::new(0).unwrap_err(), BufferError::ZeroCapacity);
    }

    #[test]
    fn test_partial_fill_is_oldest_first() {
        let buffer = filled(5, 3);
        assert_eq!(buffer.len(), 3);
        assert!(!buffer.is_full());
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_put_reports_eviction() {
        let mut buffer = RingBuffer::new(2).unwrap();
        assert_eq!(buffer.put('a'), None);
        assert_eq!(buffer.put('b'), None);
        assert_eq!(buffer.put('c'), Some('a'));
        assert_eq!(buffer.put('d'), Some('b'));
        assert_eq!(buffer.iter().copied().collect::<String>(), "cd");
    }

    #[test]
    fn test_capacity_one() {
        let buffer = filled(1, 10);
        assert_eq!(buffer.capacity(), 1);
        assert!(buffer.is_full());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(0), Ok(&9));
    }

    #[test]
    fn test_get_out_of_range() {
        let buffer = filled(4, 2);
        assert_eq!(
            buffer.get(2),
            Err(BufferError::OutOfRange { index: 2, len: 2 })
        );
        assert!(filled(4, 0).get(0).is_err());
    }

    #[test]
    fn test_clear_releases_references() {
        let shared = Rc::new(());
        let mut buffer = RingBuffer::new(3).unwrap();
        for _ in 0..5 {
            buffer.put(Rc::clone(&shared));
        }
        assert_eq!(Rc::strong_count(&shared), 4);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(Rc::strong_count(&shared), 1);

        buffer.put(Rc::clone(&shared));
        assert_eq!(buffer.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_retains_most_recent(capacity in 1usize..64, extra in 0usize..200) {
            let buffer = filled(capacity, capacity + extra);
            prop_assert_eq!(buffer.len(), capacity);
            prop_assert_eq!(*buffer.get(0).unwrap(), extra);
            prop_assert_eq!(*buffer.get(capacity - 1).unwrap(), capacity + extra - 1);
        }

        #[test]
        fn prop_under_capacity_keeps_all(capacity in 1usize..64, count in 0usize..64) {
            let count = count.min(capacity);
            let buffer = filled(capacity, count);
            prop_assert_eq!(buffer.len(), count);
            prop_assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), (0..count).collect::<Vec<_>>());
        }
    }
}
