//! Outbound Queue
//!
//! Strict FIFO of flattened messages waiting for the background writer. Each
//! entry holds a clone of a shared buffer plus how much of it has already
//! reached the socket.

use std::collections::VecDeque;
use std::io::IoSlice;

use crate::wire::FlatMessage;

/// Upper bound on entries gathered into one vectored write
const MAX_GATHER: usize = 16;

/// A queued message and its transmit progress
#[derive(Debug)]
struct QueueEntry {
    msg: FlatMessage,
    offset: usize,
}

impl QueueEntry {
    fn remaining(&self) -> &[u8] {
        &self.msg[self.offset..]
    }
}

/// Per-connection outbound queue
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<QueueEntry>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append a message, `offset` bytes of which were already written
    pub fn push(&mut self, msg: FlatMessage, offset: usize) {
        debug_assert!(offset < msg.len());
        self.entries.push_back(QueueEntry { msg, offset });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unsent bytes from the head of the queue, in order
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.entries
            .iter()
            .take(MAX_GATHER)
            .map(|e| IoSlice::new(e.remaining()))
            .collect()
    }

    /// Account for `n` bytes written; returns how many entries completed
    pub fn consume(&mut self, mut n: usize) -> usize {
        let mut completed = 0;
        while n > 0 {
            let Some(front) = self.entries.front_mut() else {
                break;
            };
            let left = front.msg.len() - front.offset;
            if n < left {
                front.offset += n;
                break;
            }
            n -= left;
            self.entries.pop_front();
            completed += 1;
        }
        completed
    }

    /// Release every entry; returns how many were dropped
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }
}
