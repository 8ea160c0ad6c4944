//! Per-device link management.
//!
//! Each device owns one [`ConnectionManager`] that tracks which control
//! server the device is assigned to and holds the single live link to it.
//! The hard invariant here is close-before-connect: a device never has two
//! live links, and an old link is always closed before a new connect attempt
//! starts, including when the assignment moves between servers.
//!
//! Connection state is published on a watch channel so the readout layer can
//! render "no connection" without touching the link itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{ControlClient, ServerConnector, RPC_TARGET};
use crate::error::ConnectionError;

/// Where a device's measurements come from, as resolved from configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerAssignment {
    /// Configured server name, used in logs and state displays.
    pub name: String,
    /// Host the control server listens on.
    pub host: String,
    /// Port the control server listens on.
    pub port: u16,
}

/// Externally visible link state of one device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live link, and no connect attempt running.
    #[default]
    Disconnected,
    /// A connect attempt is running or being retried.
    Connecting,
    /// A live link exists.
    Connected,
}

/// Exponential retry pacing for failed connect attempts.
///
/// Delays double from `initial` up to `max` and reset to `initial` after a
/// successful connect.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    /// Backoff starting at `initial` and saturating at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay to wait before the next attempt. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    /// Return to the initial delay, after a successful connect.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

struct Link {
    server: ServerAssignment,
    client: Box<dyn ControlClient>,
}

/// Owns the (at most one) live control-server link of a single device.
pub struct ConnectionManager {
    device: String,
    connector: Arc<dyn ServerConnector>,
    assignment: watch::Receiver<Option<ServerAssignment>>,
    state: watch::Sender<ConnectionState>,
    link: Option<Link>,
    backoff: Backoff,
}

impl ConnectionManager {
    pub fn new(
        device: impl Into<String>,
        connector: Arc<dyn ServerConnector>,
        assignment: watch::Receiver<Option<ServerAssignment>>,
        state: watch::Sender<ConnectionState>,
        backoff: Backoff,
    ) -> Self {
        Self {
            device: device.into(),
            connector,
            assignment,
            state,
            link: None,
            backoff,
        }
    }

    /// Latest assignment, marking it as seen for [`assignment_changed`].
    ///
    /// [`assignment_changed`]: ConnectionManager::assignment_changed
    pub fn assignment(&mut self) -> Option<ServerAssignment> {
        self.assignment.borrow_and_update().clone()
    }

    /// Whether a new assignment arrived since the last [`assignment`] call.
    ///
    /// [`assignment`]: ConnectionManager::assignment
    pub fn assignment_changed(&self) -> bool {
        // A closed channel also reports as a change so inner cycles unwind
        // to the outer loop, which tells closure apart and stops.
        self.assignment.has_changed().unwrap_or(true)
    }

    /// Whether the assignment sender is gone.
    ///
    /// Happens when the owning monitor is dropped without a shutdown call.
    /// No assignment or shutdown signal can arrive after that, so the device
    /// loop treats a closed channel the same as shutdown.
    pub fn assignment_closed(&self) -> bool {
        self.assignment.has_changed().is_err()
    }

    /// Suspend until the assignment changes or its sender is dropped.
    pub async fn assignment_event(&mut self) {
        // Err only means the sender is gone; callers re-check state either
        // way, so the result itself carries nothing.
        let _ = self.assignment.changed().await;
    }

    /// The live link, if any.
    pub fn client(&self) -> Option<&dyn ControlClient> {
        self.link.as_ref().map(|l| l.client.as_ref())
    }

    /// Whether the live link (if any) goes to `target`.
    pub fn is_connected_to(&self, target: &ServerAssignment) -> bool {
        self.link.as_ref().is_some_and(|l| l.server == *target)
    }

    /// Close the live link, if any, and publish `Disconnected`.
    ///
    /// Safe to call on an already-dead link; closing is quiet either way.
    pub async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            debug!(
                device = %self.device,
                server = %link.server.name,
                "Closing control server link"
            );
            link.client.close().await;
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Make one connect attempt to `target`.
    ///
    /// Any existing link is closed first. On success the backoff resets and
    /// `Connected` is published; on failure the state stays `Connecting` so
    /// the caller can retry after [`next_backoff`].
    ///
    /// [`next_backoff`]: ConnectionManager::next_backoff
    pub async fn connect(&mut self, target: &ServerAssignment) -> Result<(), ConnectionError> {
        if let Some(link) = self.link.take() {
            debug!(
                device = %self.device,
                server = %link.server.name,
                "Closing control server link before reconnect"
            );
            link.client.close().await;
        }
        self.state.send_replace(ConnectionState::Connecting);

        match self.connector.connect(&target.host, target.port, RPC_TARGET).await {
            Ok(client) => {
                self.link = Some(Link {
                    server: target.clone(),
                    client,
                });
                self.backoff.reset();
                self.state.send_replace(ConnectionState::Connected);
                info!(
                    device = %self.device,
                    server = %target.name,
                    host = %target.host,
                    port = target.port,
                    "Connected to control server"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    device = %self.device,
                    server = %target.name,
                    error = %err,
                    "Connect attempt failed"
                );
                Err(err)
            }
        }
    }

    /// Delay to wait before the next connect attempt.
    pub fn next_backoff(&mut self) -> Duration {
        self.backoff.next_delay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MeasurementRequest;
    use crate::error::RemoteError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Ledger {
        connects: AtomicUsize,
        closes: AtomicUsize,
        refuse_next: AtomicBool,
    }

    struct StubClient {
        ledger: Arc<Ledger>,
    }

    #[async_trait]
    impl ControlClient for StubClient {
        async fn request_measurement(&self, _request: MeasurementRequest) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn set_fast_mode(&self, _device: &str, _enabled: bool) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn set_auto_exposure(&self, _device: &str, _enabled: bool) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn set_reference_frequency(
            &self,
            _device: &str,
            _frequency_hz: f64,
        ) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn set_exposure(
            &self,
            _device: &str,
            _channel: usize,
            _exposure: Duration,
        ) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn min_exposure(&self) -> Result<Duration, RemoteError> {
            Ok(Duration::from_millis(1))
        }
        async fn max_exposure(&self) -> Result<Duration, RemoteError> {
            Ok(Duration::from_millis(100))
        }
        async fn close(&self) {
            self.ledger.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StubConnector {
        ledger: Arc<Ledger>,
    }

    #[async_trait]
    impl ServerConnector for StubConnector {
        async fn connect(
            &self,
            host: &str,
            _port: u16,
            target: &str,
        ) -> Result<Box<dyn ControlClient>, ConnectionError> {
            assert_eq!(target, RPC_TARGET);
            self.ledger.connects.fetch_add(1, Ordering::SeqCst);
            if self.ledger.refuse_next.swap(false, Ordering::SeqCst) {
                return Err(ConnectionError::Refused(host.to_owned()));
            }
            Ok(Box::new(StubClient {
                ledger: Arc::clone(&self.ledger),
            }))
        }
    }

    fn assignment(name: &str) -> ServerAssignment {
        ServerAssignment {
            name: name.to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 3251,
        }
    }

    fn manager_with_ledger() -> (ConnectionManager, Arc<Ledger>, watch::Receiver<ConnectionState>) {
        let ledger = Arc::new(Ledger::default());
        let connector = Arc::new(StubConnector {
            ledger: Arc::clone(&ledger),
        });
        let (_assign_tx, assign_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let manager = ConnectionManager::new(
            "violet",
            connector,
            assign_rx,
            state_tx,
            Backoff::new(Duration::from_millis(500), Duration::from_secs(30)),
        );
        (manager, ledger, state_rx)
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn backoff_resets_to_initial() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn reconnecting_closes_the_previous_link_first() {
        let (mut manager, ledger, state) = manager_with_ledger();

        manager.connect(&assignment("wlm-a")).await.unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        manager.connect(&assignment("wlm-b")).await.unwrap();
        assert_eq!(ledger.connects.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.closes.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected_to(&assignment("wlm-b")));
        assert!(!manager.is_connected_to(&assignment("wlm-a")));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (mut manager, ledger, state) = manager_with_ledger();
        manager.connect(&assignment("wlm-a")).await.unwrap();

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(ledger.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
        assert!(manager.client().is_none());
    }

    #[tokio::test]
    async fn failed_connect_leaves_connecting_published() {
        let (mut manager, ledger, state) = manager_with_ledger();
        ledger.refuse_next.store(true, Ordering::SeqCst);

        let result = manager.connect(&assignment("wlm-a")).await;
        assert!(result.is_err());
        assert_eq!(*state.borrow(), ConnectionState::Connecting);
        assert!(manager.client().is_none());
    }

    #[tokio::test]
    async fn dropped_assignment_sender_reads_as_closed() {
        let ledger = Arc::new(Ledger::default());
        let connector = Arc::new(StubConnector { ledger });
        let (assign_tx, assign_rx) = watch::channel(None);
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let mut manager = ConnectionManager::new(
            "violet",
            connector,
            assign_rx,
            state_tx,
            Backoff::new(Duration::from_millis(500), Duration::from_secs(30)),
        );

        assert!(!manager.assignment_changed());
        assert!(!manager.assignment_closed());

        // An ordinary change is a change, not a closure.
        assign_tx.send_replace(Some(assignment("wlm-a")));
        assert!(manager.assignment_changed());
        assert!(!manager.assignment_closed());
        assert_eq!(
            manager.assignment().map(|a| a.name),
            Some("wlm-a".to_owned())
        );
        assert!(!manager.assignment_changed());

        // A dropped sender is both: the change flag unwinds inner cycles,
        // the closed flag stops the outer loop.
        drop(assign_tx);
        assert!(manager.assignment_changed());
        assert!(manager.assignment_closed());

        // The event wait must return rather than hang on the dead channel.
        manager.assignment_event().await;
    }
}
