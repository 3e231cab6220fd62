use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::bgp::family::{AddressFamily, DEFAULT_FAMILIES};
use crate::error::ConfigError;

/// Default BGP port.
pub const DEFAULT_BGP_PORT: u16 = 179;

/// Hold time proposed in our OPEN, in seconds.
pub const DEFAULT_HOLD_TIME: u16 = 180;

/// Delay before reconnecting a failed session, in seconds.
pub const DEFAULT_CONNECT_RETRY_SECS: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bgp: BgpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BgpConfig {
    /// Local address; also used as the BGP router id.
    pub local_address: Ipv4Addr,
    /// Peers to open sessions with.
    #[serde(default)]
    pub peers: Vec<IpAddr>,
    #[serde(default = "default_bgp_port")]
    pub bgp_port: u16,
    /// Local AS, also expected from peers (no inter-AS sessions).
    pub my_as: u32,
    /// Offer Route Target Constraint to peers.
    #[serde(default)]
    pub enable_rtc: bool,
    #[serde(default = "default_hold_time")]
    pub hold_time: u16,
    #[serde(default = "default_connect_retry_secs")]
    pub connect_retry_secs: u64,
    /// VPN families offered to peers; RTC is controlled by `enable_rtc`.
    #[serde(default = "default_families")]
    pub enabled_families: Vec<AddressFamily>,
}

fn default_bgp_port() -> u16 {
    DEFAULT_BGP_PORT
}

fn default_hold_time() -> u16 {
    DEFAULT_HOLD_TIME
}

fn default_connect_retry_secs() -> u64 {
    DEFAULT_CONNECT_RETRY_SECS
}

fn default_families() -> Vec<AddressFamily> {
    DEFAULT_FAMILIES.to_vec()
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        content.parse()
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.bgp.validate()?;
        Ok(config)
    }
}

impl BgpConfig {
    /// A configuration with every optional field at its default.
    pub fn new(local_address: Ipv4Addr, my_as: u32) -> Self {
        Self {
            local_address,
            peers: Vec::new(),
            bgp_port: DEFAULT_BGP_PORT,
            my_as,
            enable_rtc: false,
            hold_time: DEFAULT_HOLD_TIME,
            connect_retry_secs: DEFAULT_CONNECT_RETRY_SECS,
            enabled_families: default_families(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.my_as == 0 {
            return Err(ConfigError::Invalid("my_as must not be 0".into()));
        }
        // RFC 4271: hold time is either zero or at least three seconds
        if self.hold_time == 1 || self.hold_time == 2 {
            return Err(ConfigError::Invalid(format!(
                "hold_time must be 0 or at least 3, got {}",
                self.hold_time
            )));
        }
        if self.enabled_families.iter().any(|f| f.is_rtc()) {
            return Err(ConfigError::Invalid(
                "ipv4/rtc is controlled by enable_rtc, not enabled_families".into(),
            ));
        }
        let mut seen = HashSet::new();
        for family in &self.enabled_families {
            if !seen.insert(family) {
                return Err(ConfigError::Invalid(format!("duplicate family {}", family)));
            }
        }
        Ok(())
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_secs(self.connect_retry_secs)
    }
}
