//! Single-slot cooperative wake signal.
//!
//! One [`WakeSignal`] exists per device. Producers (the display surface
//! queueing an edit, the measurement ingestion path writing new data, a
//! server reassignment, process shutdown) call [`set`](WakeSignal::set) to
//! interrupt the device's sync loop wherever it is suspended. The loop calls
//! [`clear`](WakeSignal::clear) at the top of each iteration *before* reading
//! any state, so a signal raised while the iteration works is latched and
//! causes prompt re-evaluation instead of being absorbed.
//!
//! Semantics match a latched event: `set` is idempotent and wakes every
//! current waiter; the flag stays raised until `clear`; `wait` returns
//! immediately when the flag is already raised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Latched single-slot wake event.
///
/// `set`/`clear` are atomic flag transitions independent of any in-flight
/// `wait`, so producers may race `clear` freely.
#[derive(Debug, Default)]
pub struct WakeSignal {
    raised: AtomicBool,
    notify: Notify,
}

impl WakeSignal {
    /// Create a signal in the cleared state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal, waking all current waiters. Idempotent.
    pub fn set(&self) {
        self.raised.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Reset the signal. Does not affect waiters already woken.
    pub fn clear(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }

    /// True when the signal is currently raised.
    pub fn is_set(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Suspend until the signal is raised; return immediately if it already
    /// is. Waiting does not consume the flag.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register as a waiter before re-checking the flag so a `set`
            // racing this call cannot slip between check and suspend.
            notified.as_mut().enable();
            if self.raised.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Like [`wait`](Self::wait) but give up after `timeout`.
    ///
    /// Returns `true` when woken by the signal (or when it was already
    /// raised), `false` when the timeout elapsed first.
    pub async fn wait_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}
