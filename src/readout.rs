//! Display-ready derivations of cached device state.
//!
//! Pure functions that turn store values into the strings and scaled traces
//! a display surface renders. No layout, no widget types; a surface decides
//! where the text goes, this module decides what it says.
//!
//! Conventions carried over from the lab displays these feed:
//!
//! - Frequencies render in THz with seven decimals.
//! - Detuning renders in MHz with one decimal, relative to the device's
//!   reference frequency, and is blanked once it exceeds the plausible
//!   window (a detuning that large means the wavemeter saw a different
//!   laser).
//! - Exposure problems and measurement errors take over the detuning slot
//!   as `Low`, `High` or `Error`.

use crate::connection::ConnectionState;
use crate::measurement::{DeviceSettings, FrequencyReading, MeasurementStatus};

/// Detunings beyond this window render as `-`.
pub const DETUNING_WINDOW_HZ: f64 = 100.0e9;

/// Full scale of raw OSA trace samples.
const TRACE_FULL_SCALE: f32 = 32767.0;

/// How a readout should be emphasized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadoutTone {
    /// Ordinary value.
    Normal,
    /// Value needs attention (bad exposure, measurement error).
    Caution,
}

/// One device's frequency line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrequencyReadout {
    /// Measured frequency with its `THz` unit, or `-` when no usable
    /// measurement exists.
    pub frequency: String,
    /// Detuning in MHz, a status word, or `-`.
    pub detuning: String,
    /// Emphasis for the line.
    pub tone: ReadoutTone,
}

/// Derive the frequency line from the cached reading and the reference
/// frequency (Hz) the detuning is measured against.
pub fn frequency_readout(reading: Option<&FrequencyReading>, reference_hz: f64) -> FrequencyReadout {
    let blank = FrequencyReadout {
        frequency: "-".to_owned(),
        detuning: "-".to_owned(),
        tone: ReadoutTone::Normal,
    };

    let reading = match reading {
        Some(reading) => reading,
        None => return blank,
    };

    if let Some(status) = status_word(reading.status) {
        return FrequencyReadout {
            frequency: "-".to_owned(),
            detuning: status.to_owned(),
            tone: ReadoutTone::Caution,
        };
    }

    let frequency_hz = match reading.frequency_hz {
        Some(frequency_hz) => frequency_hz,
        None => return blank,
    };

    let detuning_hz = frequency_hz - reference_hz;
    let detuning = if detuning_hz.abs() > DETUNING_WINDOW_HZ {
        "-".to_owned()
    } else {
        format!("{:.1}", detuning_hz / 1.0e6)
    };

    FrequencyReadout {
        frequency: format!("{:.7} THz", frequency_hz / 1.0e12),
        detuning,
        tone: ReadoutTone::Normal,
    }
}

/// Word that takes over the detuning slot for a non-okay measurement.
fn status_word(status: MeasurementStatus) -> Option<&'static str> {
    match status {
        MeasurementStatus::Okay => None,
        MeasurementStatus::UnderExposed => Some("Low"),
        MeasurementStatus::OverExposed => Some("High"),
        MeasurementStatus::Error => Some("Error"),
    }
}

/// Lock status line for a device.
pub fn lock_text(settings: Option<&DeviceSettings>) -> String {
    match settings {
        Some(s) if s.locked => match &s.lock_owner {
            Some(owner) => format!("locked by: {owner}"),
            None => "locked".to_owned(),
        },
        _ => "unlocked".to_owned(),
    }
}

/// Scale raw OSA samples to full-scale floats, roughly in `[-1, 1]`.
pub fn scale_trace(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| f32::from(s) / TRACE_FULL_SCALE)
        .collect()
}

/// Overlay text for a device whose link is not up, `None` when connected.
pub fn connection_notice(state: ConnectionState) -> Option<&'static str> {
    match state {
        ConnectionState::Connected => None,
        ConnectionState::Disconnected | ConnectionState::Connecting => Some("no connection"),
    }
}
