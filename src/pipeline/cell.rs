//! Single-slot register holding the latest published frame

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::detect::Detection;

/// One published capture iteration: the encoded frame and the detections
/// that were drawn onto it. Never mutated after publication.
#[derive(Debug)]
pub struct FramePacket {
    /// Starts at 1 and increases by one per publish
    pub sequence: u64,
    pub jpeg: Bytes,
    pub detections: Vec<Detection>,
    /// When the source frame was captured
    pub captured_at: Instant,
    pub published_at: Instant,
}

impl FramePacket {
    /// Time from capture to publication
    pub fn latency(&self) -> Duration {
        self.published_at.saturating_duration_since(self.captured_at)
    }
}

/// Latest-value cell shared between the capture loop (sole writer) and any
/// number of readers.
///
/// Frame and detections live in one `Arc<FramePacket>` behind a mutex, so a
/// snapshot always returns a pair produced by a single `publish`. Readers
/// hold the lock only long enough to clone the `Arc`.
pub struct FrameCell {
    slot: Mutex<Option<Arc<FramePacket>>>,
    published: Notify,
}

impl Default for FrameCell {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCell {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            published: Notify::new(),
        }
    }

    /// Replace frame and detections as one unit. Returns the new sequence number.
    pub fn publish(&self, jpeg: Bytes, detections: Vec<Detection>) -> u64 {
        self.publish_captured(jpeg, detections, Instant::now())
    }

    /// `publish` for a frame captured at `captured_at`
    pub fn publish_captured(
        &self,
        jpeg: Bytes,
        detections: Vec<Detection>,
        captured_at: Instant,
    ) -> u64 {
        let mut slot = self.lock();
        let sequence = slot.as_ref().map_or(1, |packet| packet.sequence + 1);
        let previous = slot.replace(Arc::new(FramePacket {
            sequence,
            jpeg,
            detections,
            captured_at,
            published_at: Instant::now(),
        }));
        drop(slot);
        // Free the superseded frame outside the critical section
        drop(previous);

        self.published.notify_waiters();
        sequence
    }

    /// The current packet, or `None` if nothing has been published yet
    pub fn snapshot(&self) -> Option<Arc<FramePacket>> {
        self.lock().clone()
    }

    /// Resolves on the next `publish`. Only waiters registered before the
    /// publish are woken, so callers pair this with a fallback timeout.
    pub fn published(&self) -> Notified<'_> {
        self.published.notified()
    }

    /// Number of publishes so far
    pub fn published_count(&self) -> u64 {
        self.lock().as_ref().map_or(0, |packet| packet.sequence)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<FramePacket>>> {
        // The critical sections cannot panic mid-update, so a poisoned slot
        // still holds a complete packet
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
