//! Simulated control server.
//!
//! Provides an in-memory wavelength-meter control server for running the
//! monitor without lab hardware and for exercising the sync machinery in
//! tests. The simulated server is authoritative for device settings, answers
//! measurement requests with synthesized data, and can be scripted to fail
//! in the ways real servers fail.
//!
//! # Components
//!
//! - [`MockWlmServer`] - One simulated server, holding per-device state
//! - [`MockConnector`] - [`ServerConnector`] routing host/port pairs to
//!   simulated servers
//!
//! # Failure scripting
//!
//! - `refuse_next_connects(n)` - The next `n` connect attempts are refused
//! - `fail_next_call()` - The next call on any live link is rejected
//! - `drop_links()` - All live links start reporting the connection lost

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::client::{ControlClient, MeasurementRequest, ServerConnector};
use crate::error::{ConnectionError, RemoteError};
use crate::measurement::{
    DeviceSettings, FrequencyReading, MeasurementSink, MeasurementStatus, OsaTrace,
    EXPOSURE_CHANNELS,
};

/// Samples per synthesized OSA trace.
const TRACE_LEN: usize = 512;

/// Frequency jitter applied to synthesized measurements, in Hz.
const JITTER_HZ: f64 = 5.0e6;

// =============================================================================
// MockWlmServer - One simulated control server
// =============================================================================

/// Everything a client call can be observed as, for test assertions.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerCall {
    /// `request_measurement` with the forwarded scheduling parameters.
    RequestMeasurement {
        /// Requested device.
        device: String,
        /// Oldest acceptable cached result.
        max_age: Duration,
        /// Scheduling priority, smaller is more urgent.
        priority: u8,
    },
    /// `set_fast_mode`.
    SetFastMode {
        /// Target device.
        device: String,
        /// Requested flag value.
        enabled: bool,
    },
    /// `set_auto_exposure`.
    SetAutoExposure {
        /// Target device.
        device: String,
        /// Requested flag value.
        enabled: bool,
    },
    /// `set_reference_frequency`.
    SetReferenceFrequency {
        /// Target device.
        device: String,
        /// Requested reference in Hz.
        frequency_hz: f64,
    },
    /// `set_exposure`.
    SetExposure {
        /// Target device.
        device: String,
        /// Sensor channel.
        channel: usize,
        /// Requested exposure time.
        exposure: Duration,
    },
    /// `min_exposure`.
    MinExposure,
    /// `max_exposure`.
    MaxExposure,
}

#[derive(Debug)]
struct DeviceProfile {
    base_frequency_hz: f64,
}

struct ServerInner {
    settings: Mutex<HashMap<String, DeviceSettings>>,
    profiles: Mutex<HashMap<String, DeviceProfile>>,
    calls: Mutex<Vec<ServerCall>>,
    sink: Mutex<Option<Arc<dyn MeasurementSink>>>,
    live_handles: AtomicUsize,
    max_live_handles: AtomicUsize,
    connect_attempts: AtomicUsize,
    refuse_connects: AtomicUsize,
    fail_next_call: AtomicBool,
    // Bumped by drop_links(); handles from older generations are dead.
    link_generation: AtomicUsize,
    min_exposure: Duration,
    max_exposure: Duration,
}

/// One simulated control server. Cheap to clone; clones share state.
///
/// Settings held here are authoritative, the same way a real control server
/// owns its device settings. Measurement requests synthesize a plausible
/// reading and trace and deliver them through the attached
/// [`MeasurementSink`], which is how data reaches the state store.
#[derive(Clone)]
pub struct MockWlmServer {
    inner: Arc<ServerInner>,
}

impl MockWlmServer {
    /// Create a server with no devices and default exposure limits.
    pub fn new() -> Self {
        Self::with_exposure_limits(Duration::from_millis(1), Duration::from_millis(500))
    }

    /// Create a server advertising the given exposure limits.
    pub fn with_exposure_limits(min: Duration, max: Duration) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                settings: Mutex::new(HashMap::new()),
                profiles: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                sink: Mutex::new(None),
                live_handles: AtomicUsize::new(0),
                max_live_handles: AtomicUsize::new(0),
                connect_attempts: AtomicUsize::new(0),
                refuse_connects: AtomicUsize::new(0),
                fail_next_call: AtomicBool::new(false),
                link_generation: AtomicUsize::new(0),
                min_exposure: min,
                max_exposure: max,
            }),
        }
    }

    /// Register a device this server can measure. Seeds the authoritative
    /// settings with the base frequency as the reference.
    pub fn add_device(&self, device: impl Into<String>, base_frequency_hz: f64) {
        let device = device.into();
        lock(&self.inner.profiles).insert(
            device.clone(),
            DeviceProfile { base_frequency_hz },
        );
        lock(&self.inner.settings).insert(
            device,
            DeviceSettings {
                reference_frequency_hz: base_frequency_hz,
                exposure: [self.inner.min_exposure; EXPOSURE_CHANNELS],
                ..DeviceSettings::default()
            },
        );
    }

    /// Attach the sink that synthesized measurements are delivered to.
    pub fn attach_sink(&self, sink: Arc<dyn MeasurementSink>) {
        *lock(&self.inner.sink) = Some(sink);
    }

    /// Refuse the next `n` connect attempts with a connection error.
    pub fn refuse_next_connects(&self, n: usize) {
        self.inner.refuse_connects.store(n, Ordering::SeqCst);
    }

    /// Reject the next call on any live link with a server error.
    pub fn fail_next_call(&self) {
        self.inner.fail_next_call.store(true, Ordering::SeqCst);
    }

    /// Kill every live link. Subsequent calls on them report the connection
    /// lost; new connects succeed normally.
    pub fn drop_links(&self) {
        self.inner.link_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Links currently open (connected and not yet closed).
    pub fn live_handles(&self) -> usize {
        self.inner.live_handles.load(Ordering::SeqCst)
    }

    /// Most links that were ever open at the same time.
    pub fn max_live_handles(&self) -> usize {
        self.inner.max_live_handles.load(Ordering::SeqCst)
    }

    /// Connect attempts received so far, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Every call received so far, in arrival order.
    pub fn calls(&self) -> Vec<ServerCall> {
        lock(&self.inner.calls).clone()
    }

    /// Drain the recorded calls, so assertions can be staged.
    pub fn take_calls(&self) -> Vec<ServerCall> {
        let mut calls = lock(&self.inner.calls);
        std::mem::take(&mut *calls)
    }

    /// Authoritative settings for `device`, as this server last accepted
    /// them.
    pub fn settings(&self, device: &str) -> Option<DeviceSettings> {
        lock(&self.inner.settings).get(device).cloned()
    }

    fn open(&self) -> Result<Box<dyn ControlClient>, ConnectionError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .inner
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionError::Refused("scripted refusal".to_owned()));
        }
        let live = self.inner.live_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_live_handles.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MockClient {
            server: Arc::clone(&self.inner),
            generation: self.inner.link_generation.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }
}

impl Default for MockWlmServer {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockClient - one live link to a MockWlmServer
// =============================================================================

struct MockClient {
    server: Arc<ServerInner>,
    generation: usize,
    closed: AtomicBool,
}

impl MockClient {
    /// Gate every call: dead links never reach the server, then one scripted
    /// rejection fires if armed.
    fn accept(&self, call: ServerCall) -> Result<(), RemoteError> {
        if self.closed.load(Ordering::SeqCst)
            || self.generation != self.server.link_generation.load(Ordering::SeqCst)
        {
            return Err(RemoteError::ConnectionLost);
        }
        lock(&self.server.calls).push(call);
        if self.server.fail_next_call.swap(false, Ordering::SeqCst) {
            return Err(RemoteError::Server("scripted rejection".to_owned()));
        }
        Ok(())
    }

    fn update_settings(
        &self,
        device: &str,
        apply: impl FnOnce(&mut DeviceSettings),
    ) -> Result<(), RemoteError> {
        let mut settings = lock(&self.server.settings);
        match settings.get_mut(device) {
            Some(entry) => {
                apply(entry);
                Ok(())
            }
            None => Err(RemoteError::Server(format!("Unknown device {device}"))),
        }
    }

    fn synthesize(&self, device: &str, include_trace: bool) -> Result<(), RemoteError> {
        let base = {
            let profiles = lock(&self.server.profiles);
            match profiles.get(device) {
                Some(profile) => profile.base_frequency_hz,
                None => return Err(RemoteError::Server(format!("Unknown device {device}"))),
            }
        };

        let mut rng = rand::thread_rng();
        let frequency = base + rng.gen_range(-JITTER_HZ..JITTER_HZ);
        let reading = FrequencyReading::now(Some(frequency), MeasurementStatus::Okay);

        let trace = include_trace.then(|| {
            let samples = (0..TRACE_LEN)
                .map(|i| {
                    let x = (i as f64 - TRACE_LEN as f64 / 2.0) / 32.0;
                    let peak = (-x * x / 2.0).exp();
                    let noise = rng.gen_range(-0.02..0.02);
                    ((peak * 0.9 + noise).clamp(-1.0, 1.0) * f64::from(i16::MAX)) as i16
                })
                .collect();
            OsaTrace::now(samples)
        });

        if let Some(sink) = lock(&self.server.sink).clone() {
            sink.deliver(device, reading, trace);
        }
        Ok(())
    }
}

#[async_trait]
impl ControlClient for MockClient {
    async fn request_measurement(&self, request: MeasurementRequest) -> Result<(), RemoteError> {
        self.accept(ServerCall::RequestMeasurement {
            device: request.device.clone(),
            max_age: request.max_age,
            priority: request.priority,
        })?;
        // Delivery happens before the call returns, which is what a caller
        // that asked to wait for the result observes from a real server.
        self.synthesize(&request.device, request.include_trace)
    }

    async fn set_fast_mode(&self, device: &str, enabled: bool) -> Result<(), RemoteError> {
        self.accept(ServerCall::SetFastMode {
            device: device.to_owned(),
            enabled,
        })?;
        self.update_settings(device, |s| s.fast_mode = enabled)
    }

    async fn set_auto_exposure(&self, device: &str, enabled: bool) -> Result<(), RemoteError> {
        self.accept(ServerCall::SetAutoExposure {
            device: device.to_owned(),
            enabled,
        })?;
        self.update_settings(device, |s| s.auto_exposure = enabled)
    }

    async fn set_reference_frequency(
        &self,
        device: &str,
        frequency_hz: f64,
    ) -> Result<(), RemoteError> {
        self.accept(ServerCall::SetReferenceFrequency {
            device: device.to_owned(),
            frequency_hz,
        })?;
        self.update_settings(device, |s| s.reference_frequency_hz = frequency_hz)
    }

    async fn set_exposure(
        &self,
        device: &str,
        channel: usize,
        exposure: Duration,
    ) -> Result<(), RemoteError> {
        self.accept(ServerCall::SetExposure {
            device: device.to_owned(),
            channel,
            exposure,
        })?;
        if channel >= EXPOSURE_CHANNELS {
            return Err(RemoteError::Server(format!("No exposure channel {channel}")));
        }
        if exposure < self.server.min_exposure || exposure > self.server.max_exposure {
            return Err(RemoteError::Server(format!(
                "Exposure {exposure:?} outside supported range"
            )));
        }
        self.update_settings(device, |s| s.exposure[channel] = exposure)
    }

    async fn min_exposure(&self) -> Result<Duration, RemoteError> {
        self.accept(ServerCall::MinExposure)?;
        Ok(self.server.min_exposure)
    }

    async fn max_exposure(&self) -> Result<Duration, RemoteError> {
        self.accept(ServerCall::MaxExposure)?;
        Ok(self.server.max_exposure)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.live_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// MockConnector - routes connect calls to simulated servers
// =============================================================================

/// [`ServerConnector`] backed by simulated servers, keyed by host and port.
#[derive(Default)]
pub struct MockConnector {
    servers: HashMap<(String, u16), MockWlmServer>,
}

impl MockConnector {
    /// A connector that knows no servers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `server` reachable at `host:port`.
    pub fn add_server(&mut self, host: impl Into<String>, port: u16, server: MockWlmServer) {
        self.servers.insert((host.into(), port), server);
    }
}

#[async_trait]
impl ServerConnector for MockConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        _target: &str,
    ) -> Result<Box<dyn ControlClient>, ConnectionError> {
        match self.servers.get(&(host.to_owned(), port)) {
            Some(server) => server.open(),
            None => Err(ConnectionError::Resolve(format!("{host}:{port}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(server: &MockWlmServer) -> Box<dyn ControlClient> {
        server.open().unwrap()
    }

    #[tokio::test]
    async fn settings_calls_update_authoritative_state() {
        let server = MockWlmServer::new();
        server.add_device("violet", 7.5e14);
        let client = open(&server);

        client.set_fast_mode("violet", true).await.unwrap();
        client
            .set_reference_frequency("violet", 7.51e14)
            .await
            .unwrap();

        let settings = server.settings("violet").unwrap();
        assert!(settings.fast_mode);
        assert_eq!(settings.reference_frequency_hz, 7.51e14);
        assert_eq!(
            server.calls(),
            vec![
                ServerCall::SetFastMode {
                    device: "violet".to_owned(),
                    enabled: true,
                },
                ServerCall::SetReferenceFrequency {
                    device: "violet".to_owned(),
                    frequency_hz: 7.51e14,
                },
            ]
        );
    }

    #[tokio::test]
    async fn scripted_refusals_consume_then_clear() {
        let server = MockWlmServer::new();
        server.refuse_next_connects(2);

        assert!(server.open().is_err());
        assert!(server.open().is_err());
        assert!(server.open().is_ok());
    }

    #[tokio::test]
    async fn dropped_links_report_connection_lost() {
        let server = MockWlmServer::new();
        server.add_device("ir", 3.0e14);
        let stale = open(&server);
        server.drop_links();

        let err = stale.set_fast_mode("ir", true).await.unwrap_err();
        assert!(err.is_connection_lost());
        // The dead link never reached the server.
        assert!(server.calls().is_empty());

        // A fresh link works.
        let fresh = open(&server);
        fresh.set_fast_mode("ir", true).await.unwrap();
    }

    #[tokio::test]
    async fn handle_accounting_tracks_opens_and_closes() {
        let server = MockWlmServer::new();
        let a = open(&server);
        let b = open(&server);
        assert_eq!(server.live_handles(), 2);
        assert_eq!(server.max_live_handles(), 2);

        a.close().await;
        a.close().await;
        b.close().await;
        assert_eq!(server.live_handles(), 0);
        assert_eq!(server.max_live_handles(), 2);
    }

    #[tokio::test]
    async fn unknown_hosts_do_not_resolve() {
        let mut connector = MockConnector::new();
        connector.add_server("10.0.0.1", 3251, MockWlmServer::new());

        assert!(connector.connect("10.0.0.1", 3251, "control").await.is_ok());
        assert!(connector.connect("10.0.0.2", 3251, "control").await.is_err());
    }

    #[tokio::test]
    async fn exposure_outside_limits_is_rejected() {
        let server =
            MockWlmServer::with_exposure_limits(Duration::from_millis(1), Duration::from_millis(10));
        server.add_device("dye", 5.0e14);
        let client = open(&server);

        let err = client
            .set_exposure("dye", 0, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!err.is_connection_lost());
        assert_eq!(
            server.settings("dye").unwrap().exposure[0],
            Duration::from_millis(1)
        );
    }
}
