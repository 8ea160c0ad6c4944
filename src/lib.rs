//! # wlm-monitor Core Library
//!
//! Live diagnostics client for lasers tracked by wavelength-meter control
//! servers. The crate keeps a local cache of each laser's latest measurement
//! and settings in step with whichever control server the laser is currently
//! assigned to, one independent sync loop per device.
//!
//! ## Crate Structure
//!
//! - **`client`**: The seam to a control server: the `ServerConnector` and
//!   `ControlClient` traits plus the measurement request type. Wire transport
//!   lives behind these traits, outside this crate.
//! - **`config`**: Strongly-typed settings loaded from TOML and the
//!   environment. See `config::Settings`.
//! - **`connection`**: Per-device link ownership: server assignment,
//!   close-before-connect handling, connection state publishing, reconnect
//!   backoff.
//! - **`edits`**: The per-device queue of pending local edits and the
//!   payload-less `EditIntent` type.
//! - **`error`**: The error taxonomy: `ConnectionError` for the connect
//!   phase, `RemoteError` for calls on a live link, `MonitorError` on top.
//! - **`logging`**: Structured logging setup on `tracing-subscriber`.
//! - **`measurement`**: Cached value types: frequency readings, OSA traces,
//!   device settings, exposure limits, and the `MeasurementSink` entry point
//!   for produced data.
//! - **`mock`**: In-memory control server for tests and simulated runs.
//! - **`monitor`**: The application shell that builds and owns the
//!   per-device machinery; hands out `DeviceHandle`s.
//! - **`readout`**: Pure derivation of display strings and scaled traces
//!   from cached state.
//! - **`staleness`**: Decides when cached data is due for a refresh and at
//!   what priority.
//! - **`store`**: The keyed store of last-known per-device state.
//! - **`sync_loop`**: The per-device task tying the above together.
//! - **`wake`**: Latched async wake signal the loops suspend on.

pub mod client;
pub mod config;
pub mod connection;
pub mod edits;
pub mod error;
pub mod logging;
pub mod measurement;
pub mod mock;
pub mod monitor;
pub mod readout;
pub mod staleness;
pub mod store;
pub mod sync_loop;
pub mod wake;
