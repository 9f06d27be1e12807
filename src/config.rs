use crate::error::{Error, Result};
use crate::protocol::MAX_ADDRESS;
use crate::slave::SlaveQueryConfig;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

fn deserialize_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Duration, D::Error> {
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

/// Device path and baud rate of one serial link.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub device: String,
    pub baud_rate: u32,
}

/// Runtime settings of the bridge.
///
/// Loaded from YAML; missing keys fall back to the reference deployment:
///
/// ```yaml
/// master:
///   device: /dev/ttyUSB0
///   baud_rate: 19200
/// slave:
///   device: /dev/ttyUSB1
///   baud_rate: 9600
/// addresses: [8]
/// idle_timeout: 10s
/// ```
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub master: LinkConfig,
    pub slave: LinkConfig,
    pub addresses: Vec<u8>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub idle_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub response_timeout: Duration,
    pub attempts: u32,
    pub max_in_flight: usize,
    pub verify_checksum: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            master: LinkConfig {
                device: Self::default_device_name(0),
                baud_rate: 19200,
            },
            slave: LinkConfig {
                device: Self::default_device_name(1),
                baud_rate: 9600,
            },
            addresses: vec![0x08],
            idle_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            response_timeout: Duration::from_secs(1),
            attempts: 1,
            max_in_flight: 4,
            verify_checksum: true,
        }
    }
}

impl BridgeConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "basenbridge.yaml";

    fn default_device_name(index: usize) -> String {
        if cfg!(target_os = "windows") {
            format!("COM{}", index + 1)
        } else {
            format!("/dev/ttyUSB{index}")
        }
    }

    pub fn load(config_file_path: impl AsRef<Path>) -> Result<Self> {
        let path = config_file_path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let config_file = std::fs::File::open(path)?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(Error::Config("attempts must be at least 1".into()));
        }
        if self.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be at least 1".into()));
        }
        if self.poll_interval.is_zero() || self.poll_interval > self.idle_timeout {
            return Err(Error::Config(format!(
                "poll_interval {:?} must be non-zero and not exceed idle_timeout {:?}",
                self.poll_interval, self.idle_timeout
            )));
        }
        self.allowlist().map(|_| ())
    }

    pub fn allowlist(&self) -> Result<Allowlist> {
        Allowlist::new(self.addresses.iter().copied())
    }

    pub fn slave_query(&self) -> SlaveQueryConfig {
        SlaveQueryConfig {
            attempts: self.attempts,
            response_timeout: self.response_timeout,
            poll_interval: self.poll_interval,
            verify_checksum: self.verify_checksum,
        }
    }
}

/// Addresses the bridge answers for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowlist(BTreeSet<u8>);

impl Allowlist {
    pub fn new(addresses: impl IntoIterator<Item = u8>) -> Result<Self> {
        let addresses = addresses
            .into_iter()
            .map(|address| {
                if address > MAX_ADDRESS {
                    Err(Error::InvalidAddress(address))
                } else {
                    Ok(address)
                }
            })
            .collect::<Result<BTreeSet<u8>>>()?;
        if addresses.is_empty() {
            return Err(Error::Config("address allowlist is empty".into()));
        }
        Ok(Self(addresses))
    }

    pub fn contains(&self, address: u8) -> bool {
        self.0.contains(&address)
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().copied()
    }
}
