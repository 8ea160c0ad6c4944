//! Configuration loading and validation.
//!
//! Strongly-typed settings loaded from:
//! 1. A TOML file (default `config/default.toml`)
//! 2. Environment variables prefixed with `WLM_MONITOR_`, with `__`
//!    separating nesting levels (e.g. `WLM_MONITOR_APPLICATION__LOG_LEVEL=debug`)
//!
//! Durations are written in humantime form (`"5s"`, `"500ms"`).
//!
//! # Example
//! ```no_run
//! # fn main() -> Result<(), figment::Error> {
//! use wlm_monitor::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Application: {}", settings.application.name);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Poll cadence settings.
    #[serde(default)]
    pub polling: PollingSettings,
    /// Reconnect pacing settings.
    #[serde(default)]
    pub connection: ConnectionSettings,
    /// Known control servers, by name.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerSettings>,
    /// Monitored devices, keyed by display name.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceDefinition>,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name, used in log output.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Poll cadence for the per-device sync loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Refresh interval for devices in regular mode.
    #[serde(with = "humantime_serde", default = "default_poll_time")]
    pub poll_time: Duration,
    /// Refresh interval for devices in fast mode.
    #[serde(with = "humantime_serde", default = "default_poll_time_fast")]
    pub poll_time_fast: Duration,
    /// Pause after a failed sync cycle before the next attempt.
    #[serde(with = "humantime_serde", default = "default_error_backoff")]
    pub error_backoff: Duration,
}

/// Reconnect pacing after failed connect attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    /// Ceiling the retry delay doubles up to.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

/// Address of one control server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host the control server listens on.
    pub host: String,
    /// Port the control server listens on.
    pub port: u16,
}

/// One monitored device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Name the device is registered under on its control servers.
    pub laser: String,
    /// Name of the server the device starts out assigned to. Empty or
    /// missing means unassigned until selected at runtime.
    #[serde(default)]
    pub server: String,
}

impl DeviceDefinition {
    /// Initial server assignment, with the empty string meaning none.
    pub fn initial_server(&self) -> Option<&str> {
        if self.server.is_empty() {
            None
        } else {
            Some(&self.server)
        }
    }
}

// Default value functions
fn default_name() -> String {
    "wlm-monitor".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_poll_time() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_time_fast() -> Duration {
    Duration::from_millis(500)
}

fn default_error_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            poll_time: default_poll_time(),
            poll_time_fast: default_poll_time_fast(),
            error_backoff: default_error_backoff(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl Settings {
    /// Load configuration from `config/default.toml` and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/default.toml")
    }

    /// Load configuration from a specific file path, then apply environment
    /// overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("WLM_MONITOR_").split("__"))
            .extract()
    }

    /// Parse configuration from a TOML string, without environment
    /// overrides. Intended for fixtures.
    pub fn load_str(toml: &str) -> Result<Self, figment::Error> {
        Figment::new().merge(Toml::string(toml)).extract()
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.polling.poll_time.is_zero() || self.polling.poll_time_fast.is_zero() {
            return Err("Poll intervals must be non-zero".to_owned());
        }
        if self.polling.poll_time_fast >= self.polling.poll_time {
            return Err(format!(
                "poll_time_fast ({:?}) must be shorter than poll_time ({:?})",
                self.polling.poll_time_fast, self.polling.poll_time
            ));
        }
        if self.polling.error_backoff.is_zero() {
            return Err("error_backoff must be non-zero".to_owned());
        }

        if self.connection.initial_backoff.is_zero() {
            return Err("initial_backoff must be non-zero".to_owned());
        }
        if self.connection.max_backoff < self.connection.initial_backoff {
            return Err(format!(
                "max_backoff ({:?}) must not be shorter than initial_backoff ({:?})",
                self.connection.max_backoff, self.connection.initial_backoff
            ));
        }

        for (name, server) in &self.servers {
            if server.host.is_empty() {
                return Err(format!("Server '{name}' has an empty host"));
            }
            if server.port == 0 {
                return Err(format!("Server '{name}' has port 0"));
            }
        }

        let mut lasers = std::collections::BTreeSet::new();
        for (name, device) in &self.devices {
            if device.laser.is_empty() {
                return Err(format!("Device '{name}' has an empty laser name"));
            }
            if !lasers.insert(device.laser.as_str()) {
                return Err(format!(
                    "Laser '{}' is configured for more than one device",
                    device.laser
                ));
            }
            if let Some(server) = device.initial_server() {
                if !self.servers.contains_key(server) {
                    return Err(format!(
                        "Device '{name}' references unknown server '{server}'"
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"
        [application]
        name = "bench-monitor"
        log_level = "debug"

        [polling]
        poll_time = "5s"
        poll_time_fast = "500ms"

        [servers.wlm-a]
        host = "10.255.6.1"
        port = 3251

        [servers.wlm-b]
        host = "10.255.6.2"
        port = 3251

        [devices."370 nm"]
        laser = "violet"
        server = "wlm-a"

        [devices."674 nm"]
        laser = "clock"
    "#;

    #[test]
    fn parses_fixture_with_defaults() {
        let settings = Settings::load_str(FIXTURE).unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.application.name, "bench-monitor");
        assert_eq!(settings.polling.poll_time, Duration::from_secs(5));
        assert_eq!(settings.polling.poll_time_fast, Duration::from_millis(500));
        // Unspecified values fall back to defaults.
        assert_eq!(settings.polling.error_backoff, Duration::from_millis(100));
        assert_eq!(
            settings.connection.initial_backoff,
            Duration::from_millis(500)
        );
        assert_eq!(settings.servers.len(), 2);
        assert_eq!(settings.devices["370 nm"].initial_server(), Some("wlm-a"));
        assert_eq!(settings.devices["674 nm"].initial_server(), None);
    }

    #[test]
    fn empty_input_yields_usable_defaults() {
        let settings = Settings::load_str("").unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.application.log_level, "info");
        assert!(settings.devices.is_empty());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let settings = Settings::load_str("[application]\nlog_level = \"loud\"").unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.contains("log_level"));
    }

    #[test]
    fn rejects_fast_interval_not_shorter_than_regular() {
        let settings =
            Settings::load_str("[polling]\npoll_time = \"1s\"\npoll_time_fast = \"1s\"").unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_laser_names() {
        let settings = Settings::load_str(
            "[devices.a]\nlaser = \"violet\"\n[devices.b]\nlaser = \"violet\"",
        )
        .unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.contains("more than one device"));
    }

    #[test]
    fn rejects_device_with_unknown_server() {
        let settings =
            Settings::load_str("[devices.a]\nlaser = \"violet\"\nserver = \"nowhere\"").unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.contains("nowhere"));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.toml");
        std::fs::write(&path, FIXTURE).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.application.name, "bench-monitor");
    }
}
