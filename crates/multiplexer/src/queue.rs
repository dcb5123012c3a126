//! FIFO buffer of envelopes waiting for an open transport.

use std::collections::VecDeque;

use thiserror::Error;

pub const DEFAULT_MAX_QUEUE_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("outgoing queue is full ({capacity} envelopes pending)")]
pub struct QueueFull {
    pub capacity: usize,
}

/// Result of one [`OutgoingQueue::flush`] pass.
#[derive(Debug, PartialEq, Eq)]
pub struct FlushReport<E> {
    pub sent: usize,
    pub remaining: usize,
    /// The error that stopped the pass, if any. The envelope that failed is
    /// still at the head of the queue.
    pub failure: Option<E>,
}

#[derive(Debug)]
pub struct OutgoingQueue<T> {
    items: VecDeque<T>,
    max_len: Option<usize>,
}

impl<T> OutgoingQueue<T> {
    /// `max_len = None` makes the queue unbounded.
    pub fn new(max_len: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            max_len,
        }
    }

    pub fn enqueue(&mut self, item: T) -> Result<(), QueueFull> {
        if let Some(capacity) = self.max_len {
            if self.items.len() >= capacity {
                return Err(QueueFull { capacity });
            }
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Sends queued items front to back. An item leaves the queue only after
    /// `send` accepted it; the first failure ends the pass so that nothing
    /// queued behind a failed item can overtake it.
    pub fn flush<E, F>(&mut self, mut send: F) -> FlushReport<E>
    where
        F: FnMut(&T) -> Result<(), E>,
    {
        let mut sent = 0;
        while let Some(front) = self.items.front() {
            if let Err(err) = send(front) {
                return FlushReport {
                    sent,
                    remaining: self.items.len(),
                    failure: Some(err),
                };
            }
            self.items.pop_front();
            sent += 1;
        }
        FlushReport {
            sent,
            remaining: 0,
            failure: None,
        }
    }

    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.items.retain(keep);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T> Default for OutgoingQueue<T> {
    fn default() -> Self {
        Self::new(Some(DEFAULT_MAX_QUEUE_LEN))
    }
}
