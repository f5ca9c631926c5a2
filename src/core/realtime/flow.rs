//! Outbound audio flow control.
//!
//! At most `max_unacked` chunks are in flight on the media track at once.
//! Chunks offered beyond that wait in a bounded queue; when the queue is full
//! the oldest chunk is dropped, since stale audio is worth less than fresh.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{trace, warn};

/// Flow control limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    /// Chunks allowed in flight before queueing.
    /// Default: 3
    pub max_unacked: usize,

    /// Chunks held while waiting for acks.
    /// Default: 64
    pub queue_capacity: usize,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            max_unacked: 3,
            queue_capacity: 64,
        }
    }
}

/// Gate between captured audio and the transport.
#[derive(Debug)]
pub struct AudioFlowGate {
    config: FlowControlConfig,
    in_flight: usize,
    queue: VecDeque<Bytes>,
    dropped: u64,
}

impl AudioFlowGate {
    pub fn new(config: FlowControlConfig) -> Self {
        Self {
            config,
            in_flight: 0,
            queue: VecDeque::with_capacity(config.queue_capacity),
            dropped: 0,
        }
    }

    /// Offer a captured chunk. Returns it back when it may be sent right away.
    pub fn offer(&mut self, chunk: Bytes) -> Option<Bytes> {
        if self.in_flight < self.config.max_unacked.max(1) && self.queue.is_empty() {
            self.in_flight += 1;
            return Some(chunk);
        }

        if self.config.queue_capacity == 0 {
            self.dropped += 1;
            warn!(dropped = self.dropped, "Audio queue disabled, dropping chunk");
            return None;
        }

        if self.queue.len() >= self.config.queue_capacity {
            self.queue.pop_front();
            self.dropped += 1;
            warn!(
                capacity = self.config.queue_capacity,
                dropped = self.dropped,
                "Audio queue full, dropping oldest chunk"
            );
        }
        self.queue.push_back(chunk);
        trace!(queued = self.queue.len(), in_flight = self.in_flight, "Audio chunk queued");
        None
    }

    /// Record one acknowledged chunk. Returns the next queued chunk to send, if any.
    pub fn ack(&mut self) -> Option<Bytes> {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.pull()
    }

    /// Next queued chunk, if the window has room for it.
    pub fn pull(&mut self) -> Option<Bytes> {
        if self.in_flight >= self.config.max_unacked.max(1) {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.in_flight += 1;
        Some(next)
    }

    /// A chunk handed out by `offer`/`ack` failed to send. Returns the next
    /// queued chunk, so a backlog never waits on an ack that will not come.
    pub fn release(&mut self) -> Option<Bytes> {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.pull()
    }

    /// Forget in-flight and queued audio (new connection, input disabled).
    pub fn reset(&mut self) {
        self.in_flight = 0;
        self.queue.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Chunks dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for AudioFlowGate {
    fn default() -> Self {
        Self::new(FlowControlConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(n: u8) -> Bytes {
        Bytes::from(vec![n; 4])
    }

    #[test]
    fn test_window_then_queue() {
        let mut gate = AudioFlowGate::default();
        assert_eq!(gate.offer(chunk(1)), Some(chunk(1)));
        assert_eq!(gate.offer(chunk(2)), Some(chunk(2)));
        assert_eq!(gate.offer(chunk(3)), Some(chunk(3)));
        assert_eq!(gate.offer(chunk(4)), None);
        assert_eq!(gate.in_flight(), 3);
        assert_eq!(gate.queued(), 1);

        assert_eq!(gate.ack(), Some(chunk(4)));
        assert_eq!(gate.in_flight(), 3);
        assert_eq!(gate.ack(), None);
        assert_eq!(gate.in_flight(), 2);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let mut gate = AudioFlowGate::new(FlowControlConfig {
            max_unacked: 1,
            queue_capacity: 2,
        });
        gate.offer(chunk(0));
        gate.offer(chunk(1));
        gate.offer(chunk(2));
        gate.offer(chunk(3));

        assert_eq!(gate.dropped(), 1);
        assert_eq!(gate.ack(), Some(chunk(2)));
        assert_eq!(gate.ack(), Some(chunk(3)));
        assert_eq!(gate.ack(), None);
    }

    #[test]
    fn test_queue_preserves_order_behind_backlog() {
        let mut gate = AudioFlowGate::new(FlowControlConfig {
            max_unacked: 1,
            queue_capacity: 8,
        });
        assert!(gate.offer(chunk(1)).is_some());
        assert!(gate.offer(chunk(2)).is_none());
        assert!(gate.offer(chunk(3)).is_none());
        assert_eq!(gate.queued(), 2);
        assert_eq!(gate.pull(), None);

        gate.reset();
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.queued(), 0);
    }

    #[test]
    fn test_failed_send_hands_out_backlog() {
        let mut gate = AudioFlowGate::new(FlowControlConfig {
            max_unacked: 1,
            queue_capacity: 8,
        });
        assert_eq!(gate.offer(chunk(1)), Some(chunk(1)));
        assert!(gate.offer(chunk(2)).is_none());
        assert!(gate.offer(chunk(3)).is_none());

        assert_eq!(gate.ack(), Some(chunk(2)));
        // chunk 2 failed to send; chunk 3 goes out in its place
        assert_eq!(gate.release(), Some(chunk(3)));
        assert_eq!(gate.in_flight(), 1);
        assert_eq!(gate.queued(), 0);

        // and the last failure leaves the window open for fresh audio
        assert_eq!(gate.release(), None);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.offer(chunk(4)), Some(chunk(4)));
    }
}
