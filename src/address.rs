//! Bluetooth device addresses

use std::str::FromStr;

use crate::error::ErrorKind;
use crate::Error;

/// A 48-bit Bluetooth device address.
///
/// The octets are stored least-significant first, the order in which they appear over the air. The text form is six
/// colon-separated hex octets, most-significant first (e.g. `a4:34:f1:00:11:22`), parsed case-insensitively and
/// always rendered in lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Creates an address from its octets in display (most-significant first) order.
    pub const fn new(octets: [u8; 6]) -> Self {
        let [a, b, c, d, e, f] = octets;
        DeviceAddress([f, e, d, c, b, a])
    }

    /// Creates an address from the six least significant bytes of `addr`.
    pub fn from_u64(addr: u64) -> Self {
        DeviceAddress(u64_to_6lsb(addr))
    }

    /// The address as an integer, as used by platform APIs that take a numeric Bluetooth address.
    pub fn to_u64(self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..6].copy_from_slice(&self.0);
        u64::from_le_bytes(bytes)
    }

    /// The octets in display (most-significant first) order.
    pub fn octets(&self) -> [u8; 6] {
        let [f, e, d, c, b, a] = self.0;
        [a, b, c, d, e, f]
    }
}

#[inline]
fn u64_to_6lsb(num: u64) -> [u8; 6] {
    let bytes = num.to_le_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]]
}

impl From<u64> for DeviceAddress {
    fn from(addr: u64) -> Self {
        DeviceAddress::from_u64(addr)
    }
}

impl From<DeviceAddress> for u64 {
    fn from(addr: DeviceAddress) -> Self {
        addr.to_u64()
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.octets();
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::new(ErrorKind::InvalidAddress, None, format!("'{s}'"));

        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(DeviceAddress::new(octets))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for DeviceAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for DeviceAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A hint about the kind of address a peripheral uses, passed to the transport when resolving the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum AddressType {
    /// The peripheral's public (IEEE-assigned) address
    Public,
    /// A random static or private address
    #[default]
    Random,
    /// Let the transport decide
    Unspecified,
}

impl std::fmt::Display for AddressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AddressType::Public => "public",
            AddressType::Random => "random",
            AddressType::Unspecified => "unspecified",
        })
    }
}

impl FromStr for AddressType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(AddressType::Public),
            "random" => Ok(AddressType::Random),
            "unspecified" => Ok(AddressType::Unspecified),
            _ => Err(Error::new(
                ErrorKind::InvalidOption,
                None,
                format!("invalid address type '{s}': one of [public, random, unspecified]"),
            )),
        }
    }
}
