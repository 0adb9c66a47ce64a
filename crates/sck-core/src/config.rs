//! Persisted kit configuration
//!
//! The record is postcard encoded and stored through a [`ConfigStore`]
//! (a flash page on the device, memory in tests and the simulator).

use core::str::FromStr;

use heapless::String;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::sensors::{SENSOR_COUNT, SensorType};

pub const CONFIG_VERSION: u8 = 1;

/// Largest encoded configuration record.
pub const CONFIG_MAX_SIZE: usize = 256;

pub const DEFAULT_READ_INTERVAL: u32 = 60;
pub const DEFAULT_PUBLISH_INTERVAL: u32 = 60;
pub const MIN_PUBLISH_INTERVAL: u32 = 60;
pub const MAX_PUBLISH_INTERVAL: u32 = 3600;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("configuration storage failed")]
    Store,
    #[error("no stored configuration")]
    Missing,
    #[error("stored configuration could not be decoded")]
    Decode,
    #[error("configuration does not fit the storage buffer")]
    Encode,
    #[error("stored configuration has unsupported version {found}")]
    VersionMismatch { found: u8 },
    #[error("stored configuration is marked invalid")]
    Invalid,
}

/// Raw byte persistence of the configuration record.
pub trait ConfigStore {
    type Error: core::fmt::Debug;

    /// Copy the stored record into `buf`, returning its length (0 if empty).
    fn load(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    fn save(&mut self, record: &[u8]) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KitMode {
    #[default]
    NotConfigured,
    Network,
    StorageOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub set: bool,
    pub ssid: String<32>,
    pub pass: String<64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub set: bool,
    pub token: String<8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddress {
    pub valid: bool,
    pub address: String<18>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub enabled: bool,
    /// Read the sensor every n-th read interval.
    pub every_n_int: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub version: u8,
    pub valid: bool,
    pub mode: KitMode,
    /// Seconds between publishes.
    pub publish_interval: u32,
    /// Seconds between read cycles.
    pub read_interval: u32,
    pub credentials: Credentials,
    pub token: Token,
    pub mac: MacAddress,
    pub sensors: [SensorConfig; SENSOR_COUNT],
    /// Mirror the log to `DEBUG.TXT` on the card.
    pub debug_to_card: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            valid: true,
            mode: KitMode::NotConfigured,
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            read_interval: DEFAULT_READ_INTERVAL,
            credentials: Credentials::default(),
            token: Token::default(),
            mac: MacAddress::default(),
            sensors: SensorType::ALL.map(|s| SensorConfig {
                enabled: s.info().default_enabled,
                every_n_int: 1,
            }),
            debug_to_card: false,
        }
    }
}

impl Configuration {
    /// Replace everything with defaults but keep a learned MAC address.
    pub fn reset_to_defaults(&mut self) {
        let mac = core::mem::take(&mut self.mac);
        *self = Self::default();
        if mac.valid {
            self.mac = mac;
        }
    }

    pub fn sensor(&self, sensor: SensorType) -> SensorConfig {
        self.sensors[sensor.index()]
    }

    pub fn sensor_mut(&mut self, sensor: SensorType) -> &mut SensorConfig {
        &mut self.sensors[sensor.index()]
    }

    /// Apply a publish interval received from the setup page. Out of range
    /// values are ignored, a missing value restores the default.
    pub fn apply_publish_interval(&mut self, interval: Option<i64>) {
        match interval {
            Some(pi) if pi > MIN_PUBLISH_INTERVAL as i64 && pi < MAX_PUBLISH_INTERVAL as i64 => {
                self.publish_interval = pi as u32;
            }
            Some(pi) => log::warn!("Ignoring publish interval {} s", pi),
            None => self.publish_interval = DEFAULT_PUBLISH_INTERVAL,
        }
    }

    pub fn encode(&self) -> Result<heapless::Vec<u8, CONFIG_MAX_SIZE>, ConfigError> {
        let mut buf = [0u8; CONFIG_MAX_SIZE];
        let used = postcard::to_slice(self, &mut buf)
            .map_err(|_| ConfigError::Encode)?
            .len();
        heapless::Vec::from_slice(&buf[..used]).map_err(|_| ConfigError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.is_empty() {
            return Err(ConfigError::Missing);
        }
        let config: Self = postcard::from_bytes(bytes).map_err(|_| ConfigError::Decode)?;
        if config.version != CONFIG_VERSION {
            return Err(ConfigError::VersionMismatch {
                found: config.version,
            });
        }
        if !config.valid {
            return Err(ConfigError::Invalid);
        }
        Ok(config)
    }

    pub fn load<S: ConfigStore>(store: &mut S) -> Result<Self, ConfigError> {
        let mut buf = [0u8; CONFIG_MAX_SIZE];
        let len = store.load(&mut buf).map_err(|e| {
            log::warn!("Config store read failed: {:?}", e);
            ConfigError::Store
        })?;
        Self::decode(&buf[..len.min(CONFIG_MAX_SIZE)])
    }

    pub fn save<S: ConfigStore>(&self, store: &mut S) -> Result<(), ConfigError> {
        let record = self.encode()?;
        store.save(&record).map_err(|e| {
            log::warn!("Config store write failed: {:?}", e);
            ConfigError::Store
        })
    }
}

/// Copy `s` into a bounded string, cutting at a char boundary if too long.
pub fn bounded<const N: usize>(s: &str) -> String<N> {
    if let Ok(out) = String::from_str(s) {
        return out;
    }
    let mut end = N;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    String::from_str(&s[..end]).unwrap_or_default()
}
