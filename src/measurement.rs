//! Cached measurement and settings types.
//!
//! These are the per-device values held in the [`StateStore`](crate::store):
//! the last-known wavelength measurement, the last OSA trace, and the
//! last-known copy of the server-authoritative device settings. Cached values
//! are never discarded on disconnect; stale data stays visible until fresher
//! data replaces it.
//!
//! Each cached reading carries two timestamps: a wall-clock
//! [`DateTime<Utc>`] for humans, and a monotonic [`Instant`] that the
//! [staleness clock](crate::staleness) uses to decide when a refresh is due.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Number of exposure channels per device (one per wavemeter CCD).
pub const EXPOSURE_CHANNELS: usize = 2;

/// Result classification of a wavelength measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MeasurementStatus {
    /// The measurement is valid.
    Okay,
    /// Not enough light on the wavemeter CCD.
    UnderExposed,
    /// Too much light on the wavemeter CCD.
    OverExposed,
    /// The server could not produce a measurement.
    Error,
}

impl MeasurementStatus {
    /// True when the associated frequency value is usable.
    pub fn is_okay(self) -> bool {
        matches!(self, MeasurementStatus::Okay)
    }
}

/// Last-known frequency measurement for one device.
#[derive(Clone, Debug)]
pub struct FrequencyReading {
    /// Measured optical frequency in Hz. `None` until the server has taken
    /// its first measurement for this device.
    pub frequency_hz: Option<f64>,
    /// Validity of the measurement.
    pub status: MeasurementStatus,
    /// Wall-clock time the value was received.
    pub timestamp: DateTime<Utc>,
    /// Monotonic receive time; governs staleness.
    pub received_at: Instant,
}

impl FrequencyReading {
    /// Build a reading stamped with the current time.
    pub fn now(frequency_hz: Option<f64>, status: MeasurementStatus) -> Self {
        Self {
            frequency_hz,
            status,
            timestamp: Utc::now(),
            received_at: Instant::now(),
        }
    }
}

/// Last-known optical spectrum analyzer trace for one device.
#[derive(Clone, Debug)]
pub struct OsaTrace {
    /// Raw trace samples as produced by the digitizer.
    pub samples: Vec<i16>,
    /// Wall-clock time the trace was received.
    pub timestamp: DateTime<Utc>,
    /// Monotonic receive time; governs staleness.
    pub received_at: Instant,
}

impl OsaTrace {
    /// Build a trace stamped with the current time.
    pub fn now(samples: Vec<i16>) -> Self {
        Self {
            samples,
            timestamp: Utc::now(),
            received_at: Instant::now(),
        }
    }
}

/// Per-device settings. The authoritative copy lives on the control server;
/// this is the last value pulled from it or pushed to it.
///
/// Values are kept in server units (frequencies in Hz, exposures as
/// durations). Display-unit conversion belongs to [`crate::readout`].
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceSettings {
    /// Short poll interval and elevated measurement priority when set.
    pub fast_mode: bool,
    /// Server-side automatic exposure adjustment.
    pub auto_exposure: bool,
    /// Reference frequency in Hz; detunings are displayed relative to this.
    pub reference_frequency_hz: f64,
    /// Exposure time per channel.
    pub exposure: [Duration; EXPOSURE_CHANNELS],
    /// Whether the laser is locked to the reference.
    pub locked: bool,
    /// Name of the lock holder, if the server reports one.
    pub lock_owner: Option<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            fast_mode: false,
            auto_exposure: false,
            reference_frequency_hz: 0.0,
            exposure: [Duration::ZERO; EXPOSURE_CHANNELS],
            locked: false,
            lock_owner: None,
        }
    }
}

/// Exposure bounds advertised by a control server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExposureLimits {
    /// Shortest accepted exposure.
    pub min: Duration,
    /// Longest accepted exposure.
    pub max: Duration,
}

/// Where freshly produced measurements are delivered.
///
/// The monitor shell implements this by writing the store and raising the
/// device's wake signal; a measurement source calls it the moment a result
/// for a device is ready.
pub trait MeasurementSink: Send + Sync {
    /// Deliver a new reading, and the trace when one was taken, for `device`.
    fn deliver(&self, device: &str, reading: FrequencyReading, trace: Option<OsaTrace>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_validity() {
        assert!(MeasurementStatus::Okay.is_okay());
        assert!(!MeasurementStatus::UnderExposed.is_okay());
        assert!(!MeasurementStatus::OverExposed.is_okay());
        assert!(!MeasurementStatus::Error.is_okay());
    }

    #[test]
    fn default_settings_are_inert() {
        let settings = DeviceSettings::default();
        assert!(!settings.fast_mode);
        assert!(!settings.locked);
        assert_eq!(settings.exposure.len(), EXPOSURE_CHANNELS);
        assert_eq!(settings.reference_frequency_hz, 0.0);
    }
}
