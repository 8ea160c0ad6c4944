//! Pending local edits and the per-device edit queue.
//!
//! When the user changes a control, the new value is written straight into
//! the device's settings slice of the [`StateStore`](crate::store) and a
//! payload-less [`EditIntent`] is queued. The sync loop drains the queue in
//! arrival order and re-reads the *current* settings value for each intent at
//! dispatch time, so only the most recent value of a control ever reaches
//! the server, while edits to different controls keep their relative order.
//!
//! The queue does no coalescing. Duplicate intents cost one extra remote call
//! carrying the same (latest) value, which is harmless and keeps the queue
//! trivially FIFO.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

/// A control whose value changed locally and must be pushed to the server.
///
/// Intents carry no payload; the value is re-read from the device settings
/// when the intent is drained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditIntent {
    /// The fast-mode flag changed.
    FastMode,
    /// The auto-exposure flag changed.
    AutoExposure,
    /// The reference frequency changed.
    ReferenceFrequency,
    /// The exposure for one channel changed.
    Exposure {
        /// Channel index, `< EXPOSURE_CHANNELS`.
        channel: usize,
    },
}

/// Ordered, thread-safe buffer of pending edits for one device.
///
/// `push` may be called from any thread or task concurrently with `pop`; the
/// internal lock is held only for the queue operation itself. The consumer
/// removes one intent at a time, so a failure mid-drain leaves the remainder
/// queued for the next cycle.
#[derive(Debug, Default)]
pub struct EditQueue {
    pending: Mutex<VecDeque<EditIntent>>,
}

impl EditQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an intent at the back of the queue. Never blocks beyond the
    /// internal lock.
    pub fn push(&self, intent: EditIntent) {
        self.lock().push_back(intent);
    }

    /// Remove and return the oldest pending intent, if any.
    pub fn pop(&self) -> Option<EditIntent> {
        self.lock().pop_front()
    }

    /// Number of pending intents.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no edits are pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<EditIntent>> {
        // A poisoned lock only means a panic elsewhere; the queue itself is
        // still structurally sound.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
