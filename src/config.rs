//! Connection configuration using Figment
//!
//! A [`ConnectionConfig`] is assembled before `connect` and is immutable while the
//! link is open. It is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with `PMAC_`)
//!
//! # Example
//! ```no_run
//! use pmac_remote::config::ConnectionConfig;
//!
//! let config = ConnectionConfig::load_from("config/pmac.toml")?;
//! println!("Controller: {}:{:?}", config.hostname, config.port);
//! # Ok::<(), pmac_remote::error::PmacError>(())
//! ```
//!
//! ```toml
//! hostname = "172.23.243.156"
//! port = 1025
//! transport = "ethernet"
//! timeout = "3s"
//! ```

use crate::error::{PmacError, PmacResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Which physical link a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Binary GETRESPONSE/GETBUFFER protocol over TCP.
    Ethernet,
    /// Line protocol through a terminal server.
    Telnet,
    /// RS-232 serial line.
    Serial,
    /// gpascii shell over SSH (Power PMAC).
    Ssh,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Ethernet => "ethernet",
            TransportKind::Telnet => "telnet",
            TransportKind::Serial => "serial",
            TransportKind::Ssh => "ssh",
        };
        f.write_str(name)
    }
}

/// Settings for a single controller connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Host name, or the device path for serial links.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// TCP port, or the baud rate for serial links.
    #[serde(default)]
    pub port: Option<u32>,
    /// Link type.
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    /// Per-exchange timeout. Doubled for SAVE commands.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// SSH user name.
    #[serde(default = "default_username")]
    pub username: String,
    /// SSH password.
    #[serde(default = "default_password")]
    pub password: String,
    /// Fixed axis count; skips querying the controller when set.
    #[serde(default)]
    pub num_axes: Option<u32>,
    /// Coordinate system queried by the status poller.
    #[serde(default = "default_coordinate_system")]
    pub coordinate_system: u32,
    /// Status poller cadence.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long to wait for the gpascii greeting on SSH links.
    #[serde(default = "default_gpascii_ready_timeout", with = "humantime_serde")]
    pub gpascii_ready_timeout: Duration,
    /// First MACRO station used by a Geobrick's ring axes, as a table index.
    #[serde(default)]
    pub macro_start_offset: usize,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_transport() -> TransportKind {
    TransportKind::Ethernet
}

fn default_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_username() -> String {
    "root".to_string()
}

fn default_password() -> String {
    "deltatau".to_string()
}

fn default_coordinate_system() -> u32 {
    1
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_gpascii_ready_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: None,
            transport: default_transport(),
            timeout: default_timeout(),
            username: default_username(),
            password: default_password(),
            num_axes: None,
            coordinate_system: default_coordinate_system(),
            poll_interval: default_poll_interval(),
            gpascii_ready_timeout: default_gpascii_ready_timeout(),
            macro_start_offset: 0,
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for `hostname:port` over the given link type.
    pub fn new(hostname: impl Into<String>, port: Option<u32>, transport: TransportKind) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            transport,
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file, overridden by `PMAC_*` environment variables.
    ///
    /// Example: `PMAC_TIMEOUT=5s` widens the exchange timeout.
    pub fn load_from<P: AsRef<Path>>(path: P) -> PmacResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PMAC_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> PmacResult<()> {
        if self.timeout.is_zero() {
            return Err(PmacError::Configuration(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(PmacError::Configuration(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.transport != TransportKind::Serial {
            if let Some(port) = self.port {
                if port > u32::from(u16::MAX) {
                    return Err(PmacError::Configuration(format!(
                        "port {} is not a valid TCP port",
                        port
                    )));
                }
            }
        }
        Ok(())
    }

    /// Set the per-exchange timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set SSH credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Fix the axis count instead of querying the controller
    pub fn with_num_axes(mut self, num_axes: u32) -> Self {
        self.num_axes = Some(num_axes);
        self
    }

    /// Set the status poller cadence
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the coordinate system reported by the status poller
    pub fn with_coordinate_system(mut self, cs: u32) -> Self {
        self.coordinate_system = cs;
        self
    }

    /// TCP port as `u16`, if one is configured and in range.
    pub fn tcp_port(&self) -> Option<u16> {
        self.port
            .filter(|p| *p != 0)
            .and_then(|p| u16::try_from(p).ok())
    }
}
