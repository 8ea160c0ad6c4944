//! The per-device synchronization loop.
//!
//! One long-lived task per device keeps that device's control server in step
//! with local state. Each pass through the inner cycle does three things, in
//! order: drain pending local edits to the server, request a measurement
//! refresh if the cached data has gone stale, then sleep until the next due
//! time or until the wake signal fires, whichever comes first.
//!
//! The outer cycle handles everything around the link itself: parking while
//! the device has no server assigned, connecting (with backoff between failed
//! attempts), tearing the link down on reassignment, and reconnecting when a
//! call reports the link lost. A closed assignment channel, left behind by a
//! monitor dropped without a shutdown call, counts as shutdown.
//!
//! Every suspension point waits on the device's [`WakeSignal`], so edits,
//! reassignment, data arrival and shutdown all take effect without waiting
//! out a poll interval. The loop re-checks durable state (shutdown flag,
//! assignment watch, edit queue, store timestamps) right after clearing the
//! signal, which is what makes the latch race-free: a producer that fires
//! between the clear and the wait just makes the wait return immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::MeasurementRequest;
use crate::config::PollingSettings;
use crate::connection::{ConnectionManager, ServerAssignment};
use crate::edits::{EditIntent, EditQueue};
use crate::error::RemoteError;
use crate::measurement::ExposureLimits;
use crate::staleness::{self, PollMode};
use crate::store::StateStore;
use crate::wake::WakeSignal;

/// State machine driving one device. Constructed by the monitor shell and
/// consumed by [`run`](DeviceSyncLoop::run) on its own task.
pub struct DeviceSyncLoop {
    device: String,
    store: Arc<StateStore>,
    edits: Arc<EditQueue>,
    wake: Arc<WakeSignal>,
    connection: ConnectionManager,
    polling: PollingSettings,
    shutdown: Arc<AtomicBool>,
    last_poll: Option<Instant>,
}

impl DeviceSyncLoop {
    pub fn new(
        device: impl Into<String>,
        store: Arc<StateStore>,
        edits: Arc<EditQueue>,
        wake: Arc<WakeSignal>,
        connection: ConnectionManager,
        polling: PollingSettings,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            device: device.into(),
            store,
            edits,
            wake,
            connection,
            polling,
            shutdown,
            last_poll: None,
        }
    }

    /// Drive the device until shutdown. Closes the link before returning.
    pub async fn run(mut self) {
        info!(device = %self.device, "Device sync loop started");
        loop {
            self.wake.clear();
            if self.shutting_down() {
                break;
            }
            if self.connection.assignment_closed() {
                // Owner dropped without a shutdown call. Nothing can
                // reassign or stop this device anymore, so stop here rather
                // than spin on a channel that reports changed forever.
                warn!(device = %self.device, "Assignment channel closed, stopping device loop");
                break;
            }
            match self.connection.assignment() {
                None => {
                    // Parked. Assignment changes and shutdown both raise the
                    // wake signal; a dropped sender ends the wait on its own.
                    self.connection.disconnect().await;
                    tokio::select! {
                        () = self.wake.wait() => {}
                        () = self.connection.assignment_event() => {}
                    }
                }
                Some(target) => {
                    if self.connection.is_connected_to(&target) || self.establish(&target).await {
                        self.serve().await;
                    }
                }
            }
        }
        self.connection.disconnect().await;
        info!(device = %self.device, "Device sync loop stopped");
    }

    /// Connect to `target`, retrying with backoff until connected or until
    /// shutdown/reassignment interrupts. Returns whether a link is up.
    async fn establish(&mut self, target: &ServerAssignment) -> bool {
        loop {
            self.wake.clear();
            if self.shutting_down() || self.connection.assignment_changed() {
                return false;
            }
            match self.connection.connect(target).await {
                Ok(()) => match self.refresh_server_values().await {
                    Ok(()) => return true,
                    Err(err) => {
                        warn!(
                            device = %self.device,
                            error = %err,
                            "Post-connect sync failed, retrying connection"
                        );
                        self.connection.disconnect().await;
                    }
                },
                Err(_) => {}
            }
            let delay = self.connection.next_backoff();
            debug!(device = %self.device, ?delay, "Waiting before next connect attempt");
            self.wake.wait_for(delay).await;
        }
    }

    /// Re-read server-side values that local state must mirror after a
    /// (re)connect. The store may have been edited or populated against a
    /// different server while the link was down.
    async fn refresh_server_values(&mut self) -> Result<(), RemoteError> {
        let client = match self.connection.client() {
            Some(client) => client,
            None => return Err(RemoteError::ConnectionLost),
        };
        let min = client.min_exposure().await?;
        let max = client.max_exposure().await?;
        self.store
            .set_exposure_limits(&self.device, ExposureLimits { min, max });
        debug!(device = %self.device, ?min, ?max, "Exposure limits refreshed from server");
        Ok(())
    }

    /// Inner cycle: run while connected. Returns when the link is lost, the
    /// assignment changes, or shutdown is requested.
    async fn serve(&mut self) {
        loop {
            self.wake.clear();
            if self.shutting_down() || self.connection.assignment_changed() {
                return;
            }
            match self.cycle().await {
                Ok(()) => {}
                Err(err) if err.is_connection_lost() => {
                    warn!(device = %self.device, "Control server link lost, scheduling reconnect");
                    self.connection.disconnect().await;
                    return;
                }
                Err(_) => {
                    // Already logged at the call site. Brief pause so a
                    // misbehaving server cannot spin this loop hot.
                    self.wake.wait_for(self.polling.error_backoff).await;
                }
            }
        }
    }

    /// One pass: drain edits, refresh stale data, sleep until next due.
    async fn cycle(&mut self) -> Result<(), RemoteError> {
        self.drain_edits().await?;
        let wait = self.refresh_if_due().await?;
        self.wake.wait_for(wait).await;
        Ok(())
    }

    /// Dispatch pending edits oldest-first, one at a time. The failing
    /// intent is dropped (delivery is at most once) and the remainder stays
    /// queued for the next cycle.
    async fn drain_edits(&mut self) -> Result<(), RemoteError> {
        while let Some(intent) = self.edits.pop() {
            match self.dispatch(intent).await {
                Ok(()) => debug!(device = %self.device, ?intent, "Edit applied on server"),
                Err(err) => {
                    warn!(
                        device = %self.device,
                        ?intent,
                        error = %err,
                        "Edit dropped after dispatch failure"
                    );
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Send one intent, with its value re-read from the store at dispatch
    /// time. Settings are kept in server units, so values go out unscaled.
    async fn dispatch(&self, intent: EditIntent) -> Result<(), RemoteError> {
        let settings = self.store.settings(&self.device).unwrap_or_default();
        let client = match self.connection.client() {
            Some(client) => client,
            None => return Err(RemoteError::ConnectionLost),
        };
        match intent {
            EditIntent::FastMode => client.set_fast_mode(&self.device, settings.fast_mode).await,
            EditIntent::AutoExposure => {
                client
                    .set_auto_exposure(&self.device, settings.auto_exposure)
                    .await
            }
            EditIntent::ReferenceFrequency => {
                client
                    .set_reference_frequency(&self.device, settings.reference_frequency_hz)
                    .await
            }
            EditIntent::Exposure { channel } => match settings.exposure.get(channel) {
                Some(&exposure) => client.set_exposure(&self.device, channel, exposure).await,
                None => {
                    warn!(device = %self.device, channel, "Exposure intent for unknown channel");
                    Ok(())
                }
            },
        }
    }

    /// Request a measurement if the cached data is due, then report how long
    /// until the next refresh is due.
    async fn refresh_if_due(&mut self) -> Result<Duration, RemoteError> {
        let settings = self.store.settings(&self.device).unwrap_or_default();
        let mode = PollMode::from_fast_mode(settings.fast_mode);
        let interval = mode.interval(&self.polling);

        if self.next_due_in(interval, Instant::now()) == Duration::ZERO {
            let client = match self.connection.client() {
                Some(client) => client,
                None => return Err(RemoteError::ConnectionLost),
            };
            debug!(device = %self.device, ?mode, "Requesting measurement refresh");
            let request = MeasurementRequest::poll(&self.device, interval, mode.priority());
            if let Err(err) = client.request_measurement(request).await {
                warn!(device = %self.device, error = %err, "Measurement refresh failed");
                return Err(err);
            }
            self.last_poll = Some(Instant::now());
        }

        Ok(self.next_due_in(interval, Instant::now()))
    }

    /// Remaining wait until the device is due. Cached stream timestamps
    /// govern; a successful poll also counts as a refresh so a server that
    /// answered from its own cache does not cause an immediate re-request.
    fn next_due_in(&self, interval: Duration, now: Instant) -> Duration {
        let (frequency, trace) = self.store.last_received(&self.device);
        let data_due = staleness::next_refresh_in(frequency, trace, interval, now);
        let poll_due = match self.last_poll {
            Some(polled) => staleness::time_until_due(polled, interval, now),
            None => Duration::ZERO,
        };
        data_due.max(poll_due)
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
