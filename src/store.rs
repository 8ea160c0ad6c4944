//! Process-wide store of last-known per-device state.
//!
//! Replaces ambient shared dictionaries with an explicit keyed store: one
//! slice per device holding the cached frequency reading, the cached OSA
//! trace, the last-known device settings, and the exposure limits advertised
//! by the device's control server.
//!
//! Access contract:
//!
//! - Slices are created lazily on first write and never removed; stale values
//!   persist across disconnects so the display keeps showing the last good
//!   data.
//! - Getters clone values out. No lock is ever held by a caller, so store
//!   access can be freely mixed with `.await` points.
//! - In practice each slice has a single writer at a time (the device's own
//!   sync loop, or the measurement ingestion path for that device); the store
//!   itself only guarantees per-operation consistency. Writers are expected
//!   to raise the device's wake signal after writing; the store does not
//!   notify anyone.

use crate::measurement::{DeviceSettings, ExposureLimits, FrequencyReading, OsaTrace};
use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct DeviceSlice {
    frequency: Option<FrequencyReading>,
    trace: Option<OsaTrace>,
    settings: DeviceSettings,
    settings_known: bool,
    exposure_limits: Option<ExposureLimits>,
}

/// Keyed per-device cache shared by all sync loops and the ingestion path.
#[derive(Debug, Default)]
pub struct StateStore {
    devices: DashMap<String, DeviceSlice>,
}

impl StateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-known frequency reading, if the device has ever produced one.
    pub fn frequency(&self, device: &str) -> Option<FrequencyReading> {
        self.devices.get(device).and_then(|s| s.frequency.clone())
    }

    /// Record a new frequency reading, creating the slice if needed.
    pub fn set_frequency(&self, device: &str, reading: FrequencyReading) {
        self.slice_mut(device).frequency = Some(reading);
    }

    /// Last-known OSA trace, if the device has ever produced one.
    pub fn trace(&self, device: &str) -> Option<OsaTrace> {
        self.devices.get(device).and_then(|s| s.trace.clone())
    }

    /// Record a new OSA trace, creating the slice if needed.
    pub fn set_trace(&self, device: &str, trace: OsaTrace) {
        self.slice_mut(device).trace = Some(trace);
    }

    /// Monotonic receive instants of the two cached streams, without cloning
    /// the trace samples. Used by the staleness computation.
    pub fn last_received(&self, device: &str) -> (Option<Instant>, Option<Instant>) {
        match self.devices.get(device) {
            Some(slice) => (
                slice.frequency.as_ref().map(|r| r.received_at),
                slice.trace.as_ref().map(|t| t.received_at),
            ),
            None => (None, None),
        }
    }

    /// Last-known device settings, or `None` if nothing has been cached yet.
    pub fn settings(&self, device: &str) -> Option<DeviceSettings> {
        self.devices
            .get(device)
            .filter(|s| s.settings_known)
            .map(|s| s.settings.clone())
    }

    /// Replace the cached settings wholesale (used by the ingestion path
    /// when the server pushes a full settings record).
    pub fn set_settings(&self, device: &str, settings: DeviceSettings) {
        let mut slice = self.slice_mut(device);
        slice.settings = settings;
        slice.settings_known = true;
    }

    /// Apply a local edit to the cached settings, creating the slice (with
    /// default settings) if needed. The edited copy becomes the value that
    /// intent dispatch re-reads.
    pub fn update_settings(&self, device: &str, apply: impl FnOnce(&mut DeviceSettings)) {
        let mut slice = self.slice_mut(device);
        apply(&mut slice.settings);
        slice.settings_known = true;
    }

    /// Exposure bounds fetched from the device's current control server.
    pub fn exposure_limits(&self, device: &str) -> Option<ExposureLimits> {
        self.devices.get(device).and_then(|s| s.exposure_limits)
    }

    /// Record the exposure bounds advertised by the server.
    pub fn set_exposure_limits(&self, device: &str, limits: ExposureLimits) {
        self.slice_mut(device).exposure_limits = Some(limits);
    }

    fn slice_mut(&self, device: &str) -> dashmap::mapref::one::RefMut<'_, String, DeviceSlice> {
        self.devices.entry(device.to_owned()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementStatus;
    use std::time::Duration;

    #[test]
    fn slices_are_created_lazily() {
        let store = StateStore::new();
        assert!(store.frequency("violet").is_none());
        assert!(store.trace("violet").is_none());
        assert!(store.settings("violet").is_none());
        assert_eq!(store.last_received("violet"), (None, None));

        store.set_frequency("violet", FrequencyReading::now(Some(7.5e14), MeasurementStatus::Okay));
        assert!(store.frequency("violet").is_some());
        // Unwritten parts of the slice stay empty.
        assert!(store.trace("violet").is_none());
        assert!(store.settings("violet").is_none());
    }

    #[test]
    fn cached_values_persist_until_overwritten() {
        let store = StateStore::new();
        store.set_frequency("ir", FrequencyReading::now(Some(3.0e14), MeasurementStatus::Okay));
        store.set_frequency(
            "ir",
            FrequencyReading::now(None, MeasurementStatus::UnderExposed),
        );

        let reading = store.frequency("ir").unwrap();
        assert_eq!(reading.status, MeasurementStatus::UnderExposed);
        assert_eq!(reading.frequency_hz, None);
    }

    #[test]
    fn local_edit_creates_settings_from_default() {
        let store = StateStore::new();
        store.update_settings("raman", |s| s.fast_mode = true);

        let settings = store.settings("raman").unwrap();
        assert!(settings.fast_mode);
        assert!(!settings.auto_exposure);
    }

    #[test]
    fn devices_do_not_interfere() {
        let store = StateStore::new();
        store.update_settings("a", |s| s.reference_frequency_hz = 1.0e14);
        store.update_settings("b", |s| s.reference_frequency_hz = 2.0e14);

        assert_eq!(store.settings("a").unwrap().reference_frequency_hz, 1.0e14);
        assert_eq!(store.settings("b").unwrap().reference_frequency_hz, 2.0e14);
    }

    #[test]
    fn exposure_limits_round_trip() {
        let store = StateStore::new();
        let limits = ExposureLimits {
            min: Duration::from_millis(1),
            max: Duration::from_millis(500),
        };
        store.set_exposure_limits("ir", limits);
        assert_eq!(store.exposure_limits("ir"), Some(limits));
    }

    #[test]
    fn last_received_reports_both_streams() {
        let store = StateStore::new();
        store.set_frequency("dye", FrequencyReading::now(Some(5.0e14), MeasurementStatus::Okay));
        let (freq, trace) = store.last_received("dye");
        assert!(freq.is_some());
        assert!(trace.is_none());

        store.set_trace("dye", OsaTrace::now(vec![0, 128, -128]));
        let (_, trace) = store.last_received("dye");
        assert!(trace.is_some());
    }
}
