// fixed-capacity ring buffer part of a channel.

use std::mem::replace;


// fixed-capacity FIFO queue of `T`.
//
// - `size <= capacity` always.
// - if size > 0, front is slots[offset] and back is slots[(offset + size - 1) % capacity].
// - a slot is `Some` if and only if a logical index maps to it.
pub(crate) struct RingBuffer<T> {
    slots: Box<[Option<T>]>,
    offset: usize,
    size: usize,
}

impl<T> RingBuffer<T> {
    // construct empty with the given capacity.
    pub(crate) fn new(capacity: usize) -> Self {
        RingBuffer {
            slots: (0..capacity).map(|_| None).collect(),
            offset: 0,
            size: 0,
        }
    }

    // number of elements currently held.
    pub(crate) fn len(&self) -> usize {
        self.size
    }

    // maximum number of elements.
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.size == self.capacity()
    }

    // push to back, or hand the element back if full.
    pub(crate) fn push(&mut self, elem: T) -> Result<(), T> {
        if self.is_full() {
            return Err(elem);
        }
        let idx = (self.offset + self.size) % self.capacity();
        debug_assert!(self.slots[idx].is_none(), "ring buffer slot occupied (internal bug)");
        self.slots[idx] = Some(elem);
        self.size += 1;
        Ok(())
    }

    // pop from front.
    pub(crate) fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let elem = replace(&mut self.slots[self.offset], None)
            .expect("ring buffer slot vacant (internal bug)");
        self.offset = (self.offset + 1) % self.capacity();
        self.size -= 1;
        Some(elem)
    }
}
