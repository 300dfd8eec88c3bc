//! Ordered packet queues.
//!
//! A queue holds framed chunks (header + payload) in wire order. Each
//! socket owns one for each direction it buffers; the queue is dropped
//! with its socket.

use crate::net::packet::{self, FrameError};
use bytes::Bytes;
use std::collections::VecDeque;

/// FIFO buffer of framed packets.
///
/// Insertion order is wire arrival/emission order.
#[derive(Debug, Default)]
pub struct PacketQueue {
    chunks: VecDeque<Bytes>,
}

impl PacketQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
        }
    }

    /// Frame a payload with the given sequence id and append it.
    pub fn append(&mut self, payload: &[u8], seq: u8) -> Result<(), FrameError> {
        let chunk = packet::frame(payload, seq)?;
        self.chunks.push_back(chunk);
        Ok(())
    }

    /// Append an already-framed chunk.
    pub fn append_chunk(&mut self, chunk: Bytes) {
        self.chunks.push_back(chunk);
    }

    /// Remove and return the oldest chunk, or `None` if empty.
    pub fn pop_head(&mut self) -> Option<Bytes> {
        self.chunks.pop_front()
    }

    /// Peek at the oldest chunk without removing it.
    pub fn head(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Number of queued chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Check whether the queue holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Drop all queued chunks.
    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::packet::{Header, Packet};

    #[test]
    fn test_fifo_order() {
        let mut queue = PacketQueue::new();
        queue.append(b"first", 0).unwrap();
        queue.append(b"second", 1).unwrap();
        queue.append(b"third", 2).unwrap();

        assert_eq!(queue.len(), 3);

        let a = Packet::parse(&queue.pop_head().unwrap()).unwrap();
        let b = Packet::parse(&queue.pop_head().unwrap()).unwrap();
        let c = Packet::parse(&queue.pop_head().unwrap()).unwrap();
        assert_eq!(&a.payload[..], b"first");
        assert_eq!(&b.payload[..], b"second");
        assert_eq!(&c.payload[..], b"third");
        assert!(queue.pop_head().is_none());
    }

    #[test]
    fn test_append_preserves_header_fields() {
        let mut queue = PacketQueue::new();
        queue.append(b"payload", 42).unwrap();

        let chunk = queue.pop_head().unwrap();
        let header = Header::parse(&chunk).unwrap();
        assert_eq!(header.len, 7);
        assert_eq!(header.seq, 42);
    }

    #[test]
    fn test_append_rejects_oversized() {
        let mut queue = PacketQueue::new();
        let huge = vec![0u8; crate::net::packet::MAX_PAYLOAD + 1];
        assert!(queue.append(&huge, 0).is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_append_chunk_raw() {
        let mut queue = PacketQueue::new();
        let chunk = crate::net::packet::frame(b"raw", 9).unwrap();
        queue.append_chunk(chunk.clone());
        assert_eq!(queue.head(), Some(&chunk));
    }

    #[test]
    fn test_clear() {
        let mut queue = PacketQueue::new();
        queue.append(b"x", 0).unwrap();
        queue.clear();
        assert!(queue.is_empty());
    }
}
