//! Client seam to a wavelength-meter control server.
//!
//! The sync machinery never talks to a socket directly. It goes through two
//! object-safe traits: [`ServerConnector`] turns a host/port pair into a live
//! [`ControlClient`], and [`ControlClient`] exposes the remote operations the
//! per-device loops need. Production code plugs in a wire implementation;
//! tests and `--sim` runs plug in the in-process mock server.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ConnectionError, RemoteError};

/// Name of the RPC target every control server exposes for these calls.
pub const RPC_TARGET: &str = "control";

/// Parameters of a measurement poll.
///
/// A poll does not return data inline. It tells the server how stale a cached
/// result it may satisfy the request from (`max_age`) and how urgent the
/// request is relative to other clients (`priority`, smaller is more urgent).
/// Fresh results arrive through the server's push channel and land in the
/// state store, which is also what a waited-on request resolves against.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementRequest {
    /// Device the measurement is for.
    pub device: String,
    /// Oldest cached result the server may answer with before it must
    /// schedule a fresh measurement.
    pub max_age: Duration,
    /// Scheduling priority on the server, smaller is more urgent.
    pub priority: u8,
    /// Ask for an OSA trace alongside the frequency reading.
    pub include_trace: bool,
    /// Hold the call until the result has been produced and delivered.
    pub wait_for_result: bool,
    /// Skip the broadcast notification for this result; the caller already
    /// receives it through the push channel.
    pub suppress_duplicate_signal: bool,
}

impl MeasurementRequest {
    /// Request shape used by the periodic refresh path: trace included,
    /// call held until delivery, broadcast suppressed.
    pub fn poll(device: &str, max_age: Duration, priority: u8) -> Self {
        Self {
            device: device.to_owned(),
            max_age,
            priority,
            include_trace: true,
            wait_for_result: true,
            suppress_duplicate_signal: true,
        }
    }
}

/// Factory for live control-server links.
#[async_trait]
pub trait ServerConnector: Send + Sync {
    /// Open a link to the named RPC `target` of the control server at
    /// `host:port`. The sync machinery always passes [`RPC_TARGET`].
    ///
    /// Every call must produce a fresh, independent link; callers close the
    /// old link themselves before connecting again.
    async fn connect(
        &self,
        host: &str,
        port: u16,
        target: &str,
    ) -> Result<Box<dyn ControlClient>, ConnectionError>;
}

/// Live link to one control server.
///
/// All methods may fail with [`RemoteError::ConnectionLost`], which callers
/// treat as the link being dead; other errors leave the link usable.
#[async_trait]
pub trait ControlClient: Send + Sync {
    /// Ask the server to (re-)measure a device. See [`MeasurementRequest`].
    async fn request_measurement(&self, request: MeasurementRequest) -> Result<(), RemoteError>;

    /// Switch the device between fast and regular measurement cadence.
    async fn set_fast_mode(&self, device: &str, enabled: bool) -> Result<(), RemoteError>;

    /// Enable or disable automatic exposure control for the device.
    async fn set_auto_exposure(&self, device: &str, enabled: bool) -> Result<(), RemoteError>;

    /// Set the reference frequency used for detuning, in Hz.
    async fn set_reference_frequency(&self, device: &str, frequency_hz: f64)
        -> Result<(), RemoteError>;

    /// Set the exposure time of one sensor channel.
    async fn set_exposure(
        &self,
        device: &str,
        channel: usize,
        exposure: Duration,
    ) -> Result<(), RemoteError>;

    /// Shortest exposure the server's hardware accepts.
    async fn min_exposure(&self) -> Result<Duration, RemoteError>;

    /// Longest exposure the server's hardware accepts.
    async fn max_exposure(&self) -> Result<Duration, RemoteError>;

    /// Tear the link down. Must be infallible and idempotent; a link that is
    /// already dead closes quietly.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staleness::FAST_MODE_PRIORITY;

    #[test]
    fn poll_requests_carry_the_refresh_flags() {
        let request = MeasurementRequest::poll("violet", Duration::from_millis(500), FAST_MODE_PRIORITY);
        assert_eq!(request.device, "violet");
        assert!(request.include_trace);
        assert!(request.wait_for_result);
        assert!(request.suppress_duplicate_signal);
    }
}
