//! Facade over the shared ring-buffer telemetry primitive ("data stream").
//!
//! The real transport is an external process-shared ring buffer; the core
//! only ever touches a handful of primitives, so it programs against this
//! facade: create/open a named stream, submit a value, read the latest or
//! the next value with a timeout, and read a monotonic timestamp. An
//! in-process bounded ring stands in behind the same seam.
//!
//! ```text
//! submit_value(v) ──► [ring: (id, at, value) ...] ──► latest()
//!                                              └────► next_with_timeout()
//! ```
//!
//! ## Rules
//! - Frame ids increase monotonically per stream and never repeat.
//! - `latest()` never blocks; `next_with_timeout` blocks up to its timeout.
//! - Single-writer/many-reader: writers go through [`DataStream::submit_value`],
//!   readers clone the handle freely.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// One submitted value with its sequencing metadata.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    /// Monotonically increasing frame id.
    pub id: u64,
    /// Monotonic submission timestamp.
    pub at: Instant,
    /// The submitted value.
    pub value: i64,
}

struct Ring {
    frames: VecDeque<StreamFrame>,
    next_id: u64,
    capacity: usize,
}

struct Shared {
    name: String,
    ring: Mutex<Ring>,
    wakeup: Notify,
}

/// Cloneable handle to one named stream.
#[derive(Clone)]
pub struct DataStream {
    shared: Arc<Shared>,
}

impl DataStream {
    /// Creates a named stream with a bounded ring.
    pub fn create(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                ring: Mutex::new(Ring {
                    frames: VecDeque::new(),
                    // Ids start at 1 so `after = 0` means "any frame".
                    next_id: 1,
                    capacity: capacity.max(1),
                }),
                wakeup: Notify::new(),
            }),
        }
    }

    /// Opens an existing stream. The in-process stand-in shares by handle
    /// cloning, so open is an alias for clone.
    pub fn open(&self) -> Self {
        self.clone()
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Submits a value, evicting the oldest frame when the ring is full.
    /// Returns the assigned frame id.
    pub fn submit_value(&self, value: i64) -> u64 {
        let id = {
            let mut ring = self.shared.ring.lock().expect("stream ring poisoned");
            let id = ring.next_id;
            ring.next_id += 1;
            if ring.frames.len() == ring.capacity {
                ring.frames.pop_front();
            }
            ring.frames.push_back(StreamFrame {
                id,
                at: Instant::now(),
                value,
            });
            id
        };
        self.shared.wakeup.notify_waiters();
        id
    }

    /// Most recent frame, if any. Never blocks.
    pub fn latest(&self) -> Option<StreamFrame> {
        let ring = self.shared.ring.lock().expect("stream ring poisoned");
        ring.frames.back().cloned()
    }

    /// Waits for a frame with id strictly greater than `after`, up to
    /// `timeout`. Returns `None` on expiry.
    pub async fn next_with_timeout(&self, after: u64, timeout: Duration) -> Option<StreamFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeup before checking, so a submit between the
            // check and the wait is not lost.
            let notified = self.shared.wakeup.notified();
            if let Some(frame) = self.newer_than(after) {
                return Some(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.newer_than(after);
            }
        }
    }

    fn newer_than(&self, after: u64) -> Option<StreamFrame> {
        let ring = self.shared.ring.lock().expect("stream ring poisoned");
        ring.frames.iter().find(|f| f.id > after).cloned()
    }

    /// Monotonic timestamp from the stream's clock domain.
    pub fn timestamp(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_across_eviction() {
        let stream = DataStream::create("hb", 2);
        let a = stream.submit_value(1);
        let b = stream.submit_value(2);
        let c = stream.submit_value(3);
        assert!(a < b && b < c);
        // Capacity 2: oldest evicted, latest survives.
        assert_eq!(stream.latest().unwrap().value, 3);
    }

    #[test]
    fn latest_is_none_on_empty_stream() {
        let stream = DataStream::create("empty", 8);
        assert!(stream.latest().is_none());
    }

    #[tokio::test]
    async fn next_with_timeout_sees_a_concurrent_submit() {
        let stream = DataStream::create("hb", 8);
        let writer = stream.open();
        let waiter = tokio::spawn(async move {
            stream.next_with_timeout(0, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        writer.submit_value(42);
        let frame = waiter.await.unwrap().expect("frame within timeout");
        assert_eq!(frame.value, 42);
    }

    #[tokio::test]
    async fn next_with_timeout_expires_quietly() {
        let stream = DataStream::create("hb", 8);
        let got = stream
            .next_with_timeout(0, Duration::from_millis(20))
            .await;
        assert!(got.is_none());
    }
}
