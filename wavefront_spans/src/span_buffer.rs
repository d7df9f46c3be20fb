use std::time::Duration;

use crate::{Span, TraceContext};

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 50_000;

#[derive(Debug)]
pub enum QueueEntry {
    Span { context: TraceContext, span: Span },
    /// Wakes the reporting thread out of `take()` so it can stop.
    Shutdown,
}

/// Bounded FIFO between the threads finishing spans and the reporting thread.
///
/// Producers never wait: `offer` fails when the buffer is full. Only the
/// reporting thread calls `take`.
pub struct SpanBuffer {
    sender: flume::Sender<QueueEntry>,
    receiver: flume::Receiver<QueueEntry>,
    capacity: usize,
}

impl SpanBuffer {
    pub fn new(capacity: usize) -> Self {
        // A zero capacity flume channel is a rendezvous, which would make every offer fail.
        let capacity = capacity.max(1);
        let (sender, receiver) = flume::bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Returns the entry back if there is no room for it.
    pub fn offer(&self, entry: QueueEntry) -> Result<(), QueueEntry> {
        self.sender.try_send(entry).map_err(|error| error.into_inner())
    }

    /// Waits up to `timeout` for room. Only used to deliver `Shutdown`.
    pub fn offer_timeout(&self, entry: QueueEntry, timeout: Duration) -> Result<(), QueueEntry> {
        self.sender
            .send_timeout(entry, timeout)
            .map_err(|error| error.into_inner())
    }

    /// Blocks until an entry is available.
    pub fn take(&self) -> QueueEntry {
        // Both halves live in self, so the channel cannot disconnect while we borrow it.
        self.receiver.recv().unwrap_or(QueueEntry::Shutdown)
    }

    pub fn size(&self) -> usize {
        self.receiver.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.size())
    }
}

impl Default for SpanBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_SIZE)
    }
}
