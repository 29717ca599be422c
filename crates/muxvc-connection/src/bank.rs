//! Overflow buffer for bytes a channel's reader could not take yet

use bytes::{Buf, Bytes};
use std::collections::VecDeque;

/// FIFO of received chunks awaiting delivery
///
/// Chunks are views into the connection's read buffer, so banking does
/// not copy.
#[derive(Debug, Default)]
pub struct ByteBank {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ByteBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Return bytes ahead of everything already banked
    pub fn push_front(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_front(chunk);
    }

    /// Take up to `max` bytes from the front
    pub fn take(&mut self, max: usize) -> Option<Bytes> {
        if max == 0 {
            return None;
        }
        let front = self.chunks.front_mut()?;

        let chunk = if front.len() <= max {
            self.chunks.pop_front()?
        } else {
            let head = front.slice(..max);
            front.advance(max);
            head
        };

        self.len -= chunk.len();
        Some(chunk)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_preserves_order() {
        let mut bank = ByteBank::new();
        bank.push(Bytes::from("abc"));
        bank.push(Bytes::new());
        bank.push(Bytes::from("defg"));
        assert_eq!(bank.len(), 7);

        assert_eq!(bank.take(2).unwrap(), Bytes::from("ab"));
        assert_eq!(bank.take(10).unwrap(), Bytes::from("c"));
        assert_eq!(bank.take(3).unwrap(), Bytes::from("def"));
        assert_eq!(bank.len(), 1);
        assert_eq!(bank.take(3).unwrap(), Bytes::from("g"));
        assert!(bank.is_empty());
        assert!(bank.take(3).is_none());
    }

    #[test]
    fn test_push_front_goes_first() {
        let mut bank = ByteBank::new();
        bank.push(Bytes::from("def"));
        bank.push_front(Bytes::from("abc"));
        bank.push_front(Bytes::new());
        assert_eq!(bank.len(), 6);

        assert_eq!(bank.take(4).unwrap(), Bytes::from("abc"));
        assert_eq!(bank.take(4).unwrap(), Bytes::from("def"));
    }

    #[test]
    fn test_take_zero_and_clear() {
        let mut bank = ByteBank::new();
        bank.push(Bytes::from("xyz"));
        assert!(bank.take(0).is_none());

        bank.clear();
        assert!(bank.is_empty());
        assert!(bank.take(1).is_none());
    }
}
