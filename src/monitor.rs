//! Application shell: builds and owns the per-device sync machinery.
//!
//! [`Monitor::new`] turns a validated [`Settings`] into one
//! [`DeviceSyncLoop`] per configured device plus a [`DeviceHandle`] through
//! which callers read cached state, apply local edits, and move the device
//! between servers. [`Monitor::spawn`] starts the loops on the current
//! runtime; [`Monitor::shutdown`] stops them and waits for each to close its
//! link.
//!
//! The monitor also implements [`MeasurementSink`], the entry point through
//! which produced measurements reach the state store and wake the right
//! device's loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::client::ServerConnector;
use crate::config::{ServerSettings, Settings};
use crate::connection::{Backoff, ConnectionManager, ConnectionState, ServerAssignment};
use crate::edits::{EditIntent, EditQueue};
use crate::error::MonitorError;
use crate::measurement::{
    DeviceSettings, ExposureLimits, FrequencyReading, MeasurementSink, OsaTrace, EXPOSURE_CHANNELS,
};
use crate::store::StateStore;
use crate::sync_loop::DeviceSyncLoop;
use crate::wake::WakeSignal;

struct DeviceShared {
    device: String,
    display_name: String,
    edits: Arc<EditQueue>,
    wake: Arc<WakeSignal>,
    assignment: watch::Sender<Option<ServerAssignment>>,
    state: watch::Receiver<ConnectionState>,
}

/// Cheap-to-clone per-device handle for readers and control surfaces.
///
/// Local edits follow a fixed sequence: write the new value into the store,
/// queue an intent, raise the wake signal. The device's sync loop picks the
/// edit up on its next pass and pushes it to the server.
#[derive(Clone)]
pub struct DeviceHandle {
    shared: Arc<DeviceShared>,
    store: Arc<StateStore>,
    servers: Arc<BTreeMap<String, ServerSettings>>,
}

impl DeviceHandle {
    /// Registry name the device's control servers know it by.
    pub fn device(&self) -> &str {
        &self.shared.device
    }

    /// Human-facing name from the configuration.
    pub fn display_name(&self) -> &str {
        &self.shared.display_name
    }

    /// Last-known frequency reading.
    pub fn frequency(&self) -> Option<FrequencyReading> {
        self.store.frequency(&self.shared.device)
    }

    /// Last-known OSA trace.
    pub fn trace(&self) -> Option<OsaTrace> {
        self.store.trace(&self.shared.device)
    }

    /// Last-known device settings.
    pub fn settings(&self) -> Option<DeviceSettings> {
        self.store.settings(&self.shared.device)
    }

    /// Exposure bounds advertised by the current server, once fetched.
    pub fn exposure_limits(&self) -> Option<ExposureLimits> {
        self.store.exposure_limits(&self.shared.device)
    }

    /// Current link state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Subscribe to link state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    /// Move the device to the named server, or park it with `None`.
    ///
    /// Takes effect on the sync loop's next pass: the old link is closed
    /// before any connect attempt on the new server.
    pub fn assign_server(&self, server: Option<&str>) -> Result<(), MonitorError> {
        let assignment = match server {
            Some(name) => {
                let settings = self
                    .servers
                    .get(name)
                    .ok_or_else(|| MonitorError::UnknownServer(name.to_owned()))?;
                Some(ServerAssignment {
                    name: name.to_owned(),
                    host: settings.host.clone(),
                    port: settings.port,
                })
            }
            None => None,
        };
        info!(device = %self.shared.device, server = ?server, "Server assignment changed");
        self.shared.assignment.send_replace(assignment);
        self.shared.wake.set();
        Ok(())
    }

    /// Toggle fast mode locally and queue the edit.
    pub fn set_fast_mode(&self, enabled: bool) {
        self.apply_edit(EditIntent::FastMode, |s| s.fast_mode = enabled);
    }

    /// Toggle auto exposure locally and queue the edit.
    pub fn set_auto_exposure(&self, enabled: bool) {
        self.apply_edit(EditIntent::AutoExposure, |s| s.auto_exposure = enabled);
    }

    /// Set the reference frequency (Hz) locally and queue the edit.
    pub fn set_reference_frequency(&self, frequency_hz: f64) {
        self.apply_edit(EditIntent::ReferenceFrequency, |s| {
            s.reference_frequency_hz = frequency_hz;
        });
    }

    /// Set one channel's exposure locally and queue the edit.
    pub fn set_exposure(&self, channel: usize, exposure: Duration) -> Result<(), MonitorError> {
        if channel >= EXPOSURE_CHANNELS {
            return Err(MonitorError::InvalidConfig(format!(
                "No exposure channel {channel}"
            )));
        }
        self.apply_edit(EditIntent::Exposure { channel }, |s| {
            s.exposure[channel] = exposure;
        });
        Ok(())
    }

    /// Raise the device's wake signal without changing anything else.
    pub fn raise_wake(&self) {
        self.shared.wake.set();
    }

    fn apply_edit(&self, intent: EditIntent, apply: impl FnOnce(&mut DeviceSettings)) {
        self.store.update_settings(&self.shared.device, apply);
        self.shared.edits.push(intent);
        self.shared.wake.set();
    }
}

/// Owns the store, the per-device loops, and the shutdown flag.
pub struct Monitor {
    store: Arc<StateStore>,
    servers: Arc<BTreeMap<String, ServerSettings>>,
    devices: BTreeMap<String, Arc<DeviceShared>>,
    pending: Vec<DeviceSyncLoop>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Monitor {
    /// Build the full sync machinery for every device in `settings`.
    ///
    /// Loops are constructed parked or pointed at their initial server, but
    /// nothing runs until [`spawn`](Monitor::spawn).
    pub fn new(
        settings: &Settings,
        connector: Arc<dyn ServerConnector>,
    ) -> Result<Self, MonitorError> {
        let store = Arc::new(StateStore::new());
        let servers = Arc::new(settings.servers.clone());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut devices = BTreeMap::new();
        let mut pending = Vec::new();

        for (display_name, definition) in &settings.devices {
            let device = definition.laser.clone();

            let initial = match definition.initial_server() {
                Some(name) => {
                    let server = servers
                        .get(name)
                        .ok_or_else(|| MonitorError::UnknownServer(name.to_owned()))?;
                    Some(ServerAssignment {
                        name: name.to_owned(),
                        host: server.host.clone(),
                        port: server.port,
                    })
                }
                None => None,
            };

            let (assignment_tx, assignment_rx) = watch::channel(initial);
            let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
            let edits = Arc::new(EditQueue::new());
            let wake = Arc::new(WakeSignal::default());

            let manager = ConnectionManager::new(
                device.clone(),
                Arc::clone(&connector),
                assignment_rx,
                state_tx,
                Backoff::new(
                    settings.connection.initial_backoff,
                    settings.connection.max_backoff,
                ),
            );
            pending.push(DeviceSyncLoop::new(
                device.clone(),
                Arc::clone(&store),
                Arc::clone(&edits),
                Arc::clone(&wake),
                manager,
                settings.polling.clone(),
                Arc::clone(&shutdown),
            ));

            let shared = Arc::new(DeviceShared {
                device: device.clone(),
                display_name: display_name.clone(),
                edits,
                wake,
                assignment: assignment_tx,
                state: state_rx,
            });
            if devices.insert(device.clone(), shared).is_some() {
                return Err(MonitorError::InvalidConfig(format!(
                    "Laser '{device}' is configured for more than one device"
                )));
            }
        }

        Ok(Self {
            store,
            servers,
            devices,
            pending,
            tasks: Vec::new(),
            shutdown,
        })
    }

    /// Shared state store.
    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    /// Handle for one device, by registry name.
    pub fn device(&self, device: &str) -> Option<DeviceHandle> {
        self.devices.get(device).map(|shared| DeviceHandle {
            shared: Arc::clone(shared),
            store: Arc::clone(&self.store),
            servers: Arc::clone(&self.servers),
        })
    }

    /// Handles for every configured device.
    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.devices
            .values()
            .map(|shared| DeviceHandle {
                shared: Arc::clone(shared),
                store: Arc::clone(&self.store),
                servers: Arc::clone(&self.servers),
            })
            .collect()
    }

    /// Sink through which produced measurements enter the store.
    pub fn sink(&self) -> Arc<dyn MeasurementSink> {
        Arc::new(MonitorSink {
            store: Arc::clone(&self.store),
            devices: self.devices.clone(),
        })
    }

    /// Start one sync loop task per device on the current runtime.
    pub fn spawn(&mut self) {
        for sync_loop in self.pending.drain(..) {
            self.tasks.push(tokio::spawn(sync_loop.run()));
        }
        info!(devices = self.tasks.len(), "Monitor running");
    }

    /// Stop every device loop and wait for them to finish.
    ///
    /// Loops observe the flag at their next suspension point, finish any
    /// in-flight call, close their links and exit.
    pub async fn shutdown(mut self) {
        info!("Monitor shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
        for shared in self.devices.values() {
            shared.wake.set();
        }
        for result in join_all(self.tasks.drain(..)).await {
            if let Err(err) = result {
                error!(error = %err, "Device sync task failed to join");
            }
        }
        info!("Monitor stopped");
    }
}

struct MonitorSink {
    store: Arc<StateStore>,
    devices: BTreeMap<String, Arc<DeviceShared>>,
}

impl MeasurementSink for MonitorSink {
    fn deliver(&self, device: &str, reading: FrequencyReading, trace: Option<OsaTrace>) {
        self.store.set_frequency(device, reading);
        if let Some(trace) = trace {
            self.store.set_trace(device, trace);
        }
        match self.devices.get(device) {
            Some(shared) => shared.wake.set(),
            None => debug!(device, "Measurement for a device without a sync loop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementStatus;
    use crate::mock::MockConnector;

    fn fixture() -> Settings {
        Settings::load_str(
            r#"
            [servers.wlm-a]
            host = "10.0.0.1"
            port = 3251

            [devices."370 nm"]
            laser = "violet"
            server = "wlm-a"

            [devices."674 nm"]
            laser = "clock"
            "#,
        )
        .unwrap()
    }

    fn monitor() -> Monitor {
        Monitor::new(&fixture(), Arc::new(MockConnector::new())).unwrap()
    }

    #[test]
    fn initial_assignments_come_from_config() {
        let monitor = monitor();

        let assigned = monitor.device("violet").unwrap();
        let shared = &assigned.shared;
        assert_eq!(
            shared.assignment.borrow().as_ref().map(|a| a.name.clone()),
            Some("wlm-a".to_owned())
        );

        let parked = monitor.device("clock").unwrap();
        assert!(parked.shared.assignment.borrow().is_none());
        assert_eq!(parked.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn unknown_devices_and_servers_are_rejected() {
        let monitor = monitor();
        assert!(monitor.device("nonexistent").is_none());

        let handle = monitor.device("violet").unwrap();
        let err = handle.assign_server(Some("wlm-z")).unwrap_err();
        assert!(matches!(err, MonitorError::UnknownServer(name) if name == "wlm-z"));
    }

    #[test]
    fn local_edits_write_store_queue_intent_and_wake() {
        let monitor = monitor();
        let handle = monitor.device("violet").unwrap();

        handle.set_fast_mode(true);
        handle.set_reference_frequency(7.5e14);

        let settings = handle.settings().unwrap();
        assert!(settings.fast_mode);
        assert_eq!(settings.reference_frequency_hz, 7.5e14);

        let shared = &handle.shared;
        assert_eq!(shared.edits.pop(), Some(EditIntent::FastMode));
        assert_eq!(shared.edits.pop(), Some(EditIntent::ReferenceFrequency));
        assert!(shared.wake.is_set());
    }

    #[test]
    fn exposure_channel_is_bounds_checked() {
        let monitor = monitor();
        let handle = monitor.device("violet").unwrap();

        handle.set_exposure(1, Duration::from_millis(5)).unwrap();
        assert!(handle.set_exposure(EXPOSURE_CHANNELS, Duration::from_millis(5)).is_err());
    }

    #[test]
    fn sink_delivery_writes_store_and_wakes_the_device() {
        let monitor = monitor();
        let handle = monitor.device("violet").unwrap();
        handle.shared.wake.clear();

        let sink = monitor.sink();
        sink.deliver(
            "violet",
            FrequencyReading::now(Some(7.5e14), MeasurementStatus::Okay),
            Some(OsaTrace::now(vec![1, 2, 3])),
        );

        assert!(handle.frequency().is_some());
        assert_eq!(handle.trace().unwrap().samples, vec![1, 2, 3]);
        assert!(handle.shared.wake.is_set());
    }

    #[test]
    fn assignment_change_raises_wake() {
        let monitor = monitor();
        let handle = monitor.device("clock").unwrap();
        handle.shared.wake.clear();

        handle.assign_server(Some("wlm-a")).unwrap();
        assert!(handle.shared.wake.is_set());
        assert_eq!(
            handle.shared.assignment.borrow().as_ref().map(|a| a.port),
            Some(3251)
        );

        handle.assign_server(None).unwrap();
        assert!(handle.shared.assignment.borrow().is_none());
    }
}
