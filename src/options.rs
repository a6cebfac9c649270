//! Key/value configuration for connections and scans.
//!
//! Options arrive as `(key, value)` text pairs, e.g. from a command line or a host application's settings.

use crate::error::ErrorKind;
use crate::scanner::{ScanConfig, ScanMode};
use crate::{btuuid, AddressType, DeviceAddress, Error, Result};

/// Where and how to connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct ConnectionOptions {
    /// The peripheral's device address
    #[cfg_attr(feature = "serde", serde(rename = "mac"))]
    pub address: DeviceAddress,
    /// The address type hint passed to the transport
    #[cfg_attr(feature = "serde", serde(default))]
    pub address_type: AddressType,
}

impl ConnectionOptions {
    /// Creates options for `address` with the default address type
    pub fn new(address: DeviceAddress) -> Self {
        ConnectionOptions {
            address,
            address_type: AddressType::default(),
        }
    }

    /// Parses connection options.
    ///
    /// Recognized keys are `mac` (required) and `address-type` (`public`, `random`, or `unspecified`; defaults to
    /// `random`).
    pub fn from_pairs<K, V>(pairs: &[(K, V)]) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut address = None;
        let mut address_type = AddressType::default();

        for (key, value) in pairs {
            let value = value.as_ref();
            match key.as_ref() {
                "mac" => address = Some(value.parse::<DeviceAddress>()?),
                "address-type" => address_type = value.parse()?,
                other => return Err(unknown_option(other)),
            }
        }

        let address = address.ok_or_else(|| Error::new(ErrorKind::InvalidOption, None, "missing required option 'mac'"))?;
        Ok(ConnectionOptions { address, address_type })
    }
}

impl ScanConfig {
    /// Parses scan options.
    ///
    /// Recognized keys are `scan-type` (`active` or `passive`; defaults to `active`) and `services` (a comma
    /// separated list of canonical service UUIDs to filter on).
    pub fn from_pairs<K, V>(pairs: &[(K, V)]) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = ScanConfig::default();

        for (key, value) in pairs {
            let value = value.as_ref();
            match key.as_ref() {
                "scan-type" => {
                    config.mode = match value {
                        "active" => ScanMode::Active,
                        "passive" => ScanMode::Passive,
                        _ => {
                            return Err(Error::new(
                                ErrorKind::InvalidOption,
                                None,
                                format!("invalid scan type '{value}': one of [active, passive]"),
                            ))
                        }
                    }
                }
                "services" => {
                    config.services = value
                        .split(',')
                        .map(str::trim)
                        .filter(|x| !x.is_empty())
                        .map(|x| {
                            btuuid::parse(x).ok_or_else(|| {
                                Error::new(ErrorKind::InvalidUuid, None, format!("invalid service UUID '{x}'"))
                            })
                        })
                        .collect::<Result<_>>()?;
                }
                other => return Err(unknown_option(other)),
            }
        }

        Ok(config)
    }
}

fn unknown_option(key: &str) -> Error {
    Error::new(ErrorKind::InvalidOption, None, format!("unrecognized option '{key}'"))
}
