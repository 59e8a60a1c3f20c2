// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use crate::error::{EncodeError, Result};

/// Fixed-capacity FIFO backed by a ring buffer.
///
/// Storage is reserved once at construction; pushing into a full queue is an
/// error rather than a reallocation.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    len: usize,
}

impl<T> BoundedQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        if self.is_full() {
            return Err(EncodeError::Internal(format!(
                "queue capacity {} exceeded",
                self.capacity()
            )));
        }
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(value);
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        value
    }

    pub fn peek(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
        self.head = 0;
    }

    /// Iterates oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % self.slots.len()].as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_across_wrap() {
        let mut q = BoundedQueue::with_capacity(3);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.pop(), Some(1));
        q.push(3).unwrap();
        q.push(4).unwrap();
        assert!(q.is_full());
        assert_eq!(q.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(4));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_push_full_fails() {
        let mut q = BoundedQueue::with_capacity(1);
        q.push("a").unwrap();
        assert!(matches!(q.push("b"), Err(EncodeError::Internal(_))));
        assert_eq!(q.peek(), Some(&"a"));
    }

    #[test]
    fn test_clear() {
        let mut q = BoundedQueue::with_capacity(2);
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.clear();
        assert!(q.is_empty());
        q.push(5).unwrap();
        assert_eq!(q.pop(), Some(5));
    }

    #[test]
    fn test_zero_capacity() {
        let mut q: BoundedQueue<u8> = BoundedQueue::with_capacity(0);
        assert!(q.push(1).is_err());
        assert_eq!(q.pop(), None);
    }
}
