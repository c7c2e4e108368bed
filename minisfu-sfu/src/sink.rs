//! Per-subscriber packet buffer
//!
//! A [`PacketSink`] sits between a router and one subscriber's outbound
//! track. It is bounded: when the subscriber falls behind, the oldest
//! buffered packet is discarded so the router never waits on a slow reader.

use crate::track::MediaPacket;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Result of pushing one packet into a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after discarding the oldest buffered packet
    DroppedOldest,
    /// Sink was closed; the packet was discarded
    Closed,
}

struct SinkState {
    queue: VecDeque<MediaPacket>,
    closed: bool,
}

pub struct PacketSink {
    state: Mutex<SinkState>,
    notify: Notify,
    capacity: usize,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl PacketSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(SinkState {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, packet: MediaPacket) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            let outcome = if state.queue.len() >= self.capacity {
                state.queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            state.queue.push_back(packet);
            outcome
        };
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        outcome
    }

    /// Next buffered packet without waiting
    pub fn try_recv(&self) -> Option<MediaPacket> {
        self.state.lock().queue.pop_front()
    }

    /// Wait for the next packet. Returns `None` once the sink is closed.
    pub async fn recv(&self) -> Option<MediaPacket> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(packet) = state.queue.pop_front() {
                    return Some(packet);
                }
            }
            notified.await;
        }
    }

    /// Close the sink and discard anything still buffered
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.queue.clear();
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Packets accepted so far, including ones later dropped
    #[must_use]
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Packets discarded because the buffer was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PacketSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSink")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}
