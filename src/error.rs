//! Error types for the monitor.
//!
//! The taxonomy follows the two failure domains of the client:
//!
//! - [`ConnectionError`]: the link to a control server could not be
//!   established. Never fatal: the sync loop returns to its disconnected
//!   state and retries after backoff or on the next wake.
//! - [`RemoteError`]: a call on an established link failed. Edit dispatches
//!   are dropped on this (at-most-once delivery); measurement refreshes are
//!   answered with a short fixed backoff. Only [`RemoteError::ConnectionLost`]
//!   escalates to a full reconnect cycle.
//!
//! [`MonitorError`] is the top-level type returned by the library surface
//! (configuration loading, monitor assembly). With `#[from]` conversions the
//! lower-level errors propagate through `?` without ceremony.

use thiserror::Error;

/// Convenience alias for results using the top-level error type.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Failure to establish a link to a control server.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The server actively refused or dropped the connection attempt.
    #[error("Connection refused by '{0}'")]
    Refused(String),

    /// The server address could not be resolved.
    #[error("Cannot resolve server address: {0}")]
    Resolve(String),

    /// The connection attempt did not complete in time.
    #[error("Connection attempt timed out")]
    Timeout,
}

/// Failure of a call on an established link.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The server reported a failure executing the call.
    #[error("Server-side failure: {0}")]
    Server(String),

    /// The call did not complete in time.
    #[error("Remote call timed out")]
    Timeout,

    /// The underlying link died mid-call. The handle is no longer usable.
    #[error("Connection to server lost")]
    ConnectionLost,
}

impl RemoteError {
    /// True when the handle itself became invalid and a reconnect is needed.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, RemoteError::ConnectionLost)
    }
}

/// Top-level application error.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration file could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    InvalidConfig(String),

    /// File or network I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Link establishment failure.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Failure of a remote call.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A device name that is not present in the configuration.
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    /// A server name that is not present in the configuration.
    #[error("Unknown server '{0}'")]
    UnknownServer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lost_is_the_only_fatal_remote_error() {
        assert!(RemoteError::ConnectionLost.is_connection_lost());
        assert!(!RemoteError::Timeout.is_connection_lost());
        assert!(!RemoteError::Server("busy".into()).is_connection_lost());
    }

    #[test]
    fn errors_propagate_into_monitor_error() {
        let err: MonitorError = ConnectionError::Timeout.into();
        assert!(matches!(err, MonitorError::Connection(_)));

        let err: MonitorError = RemoteError::Server("wlm exposure failed".into()).into();
        assert_eq!(
            err.to_string(),
            "Remote error: Server-side failure: wlm exposure failed"
        );
    }
}
