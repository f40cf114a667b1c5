//! This module defines range-checked types for DS485 station addresses and
//! device identifiers, meant to simplify correct usage of the API.

use snafu::{ensure, OptionExt, Snafu};

use core::convert::{TryFrom, TryInto};
use core::fmt;
use core::ops::Deref;
use core::str::FromStr;

/// Error type for this module
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// The value isn't a valid DS485 station address.
    #[snafu(display("Invalid station address"))]
    InvalidStation,
    /// The value isn't a valid DS485 device id.
    #[snafu(display("Invalid device id"))]
    InvalidDeviceId,
}

const fn invalid_station() -> InvalidStationSnafu {
    InvalidStationSnafu
}

/// Station is a range-checked [0, 63] integer, representing a bus station
/// address. The address travels in a 6-bit header field.
///
/// ## Example
/// ```
/// use ds485_proto::Station;
/// use std::convert::TryInto;
/// let st = Station::new(10).unwrap();
/// let st: Station = 10.try_into().unwrap();
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct Station(u8);

/// Create a new [`Station`], panics if it is out of range.
pub const fn station(s: u8) -> Station {
    if s <= 0x3F {
        return Station(s);
    }
    panic!("Invalid station address.")
}

impl Station {
    /// The provisional address a joining station answers a solicit with,
    /// held until the bus master assigns a real one.
    pub const PROVISIONAL: Station = Station(0x3F);

    /// Create a new station address, checking that it is in \[0, 63\].
    /// # Errors
    /// Returns [`Error::InvalidStation`] if `station` is out of range.
    pub fn new(station: impl TryInto<u8>) -> Result<Self, Error> {
        let station = station.try_into().ok().with_context(invalid_station)?;
        ensure!(station <= 0x3F, invalid_station());
        Ok(Self(station))
    }
}

impl Deref for Station {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq<usize> for Station {
    fn eq(&self, other: &usize) -> bool {
        self.0 as usize == *other
    }
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trait to convert `T: TryInto<u8>` into a [`Station`].
pub trait IntoStation {
    /// Convert self to a Station.
    /// # Errors
    /// Returns [`Error::InvalidStation`] if self isn't a valid station address.
    fn into_station(self) -> Result<Station, Error>;
}

impl IntoStation for Station {
    fn into_station(self) -> Result<Station, Error> {
        Ok(self)
    }
}

impl<T> IntoStation for T
where
    T: TryInto<u8>,
{
    fn into_station(self) -> Result<Station, Error> {
        Station::new(self)
    }
}

impl TryFrom<usize> for Station {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod station_tests {
    use super::Station;

    #[test]
    fn test_valid_stations() {
        for n in 0..=0x3F {
            let s = Station::new(n).unwrap();
            assert_eq!(*s, n);
        }
    }

    #[test]
    fn test_station() {
        let s5 = Station::new(5).unwrap();
        assert_eq!(s5, 5); // usize comparison

        assert!(Station::new(64).is_err());
        assert!(Station::new(-1).is_err());
        assert_eq!(*Station::PROVISIONAL, 0x3F);
    }
}

/// A 12-byte device identifier, split into an 8-byte upper and a 4-byte
/// lower part. Every station carries one and announces it when joining
/// the ring.
///
/// The canonical payload encoding is upper part big-endian followed by
/// lower part big-endian; see [`crate::Payload::add_device_id`].
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub struct DeviceId {
    upper: u64,
    lower: u32,
}

impl DeviceId {
    /// The all-zero id, used where no real id is known.
    pub const NULL: DeviceId = DeviceId { upper: 0, lower: 0 };

    pub const fn new(upper: u64, lower: u32) -> Self {
        Self { upper, lower }
    }

    pub const fn upper(&self) -> u64 {
        self.upper
    }

    pub const fn lower(&self) -> u32 {
        self.lower
    }
}

impl fmt::Display for DeviceId {
    /// 24 lower-case hex digits, upper part first.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:08x}", self.upper, self.lower)
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    /// Parses the 24-hex-digit form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ensure!(s.len() == 24 && s.is_ascii(), InvalidDeviceIdSnafu);
        let upper = u64::from_str_radix(&s[..16], 16)
            .ok()
            .context(InvalidDeviceIdSnafu)?;
        let lower = u32::from_str_radix(&s[16..], 16)
            .ok()
            .context(InvalidDeviceIdSnafu)?;
        Ok(Self { upper, lower })
    }
}

#[cfg(test)]
mod device_id_tests {
    use super::DeviceId;

    #[test]
    fn test_display_from_str() {
        let id = DeviceId::new(0x3504175fe0000000, 0x10001234);
        let s = id.to_string();
        assert_eq!(s, "3504175fe000000010001234");
        assert_eq!(s.parse::<DeviceId>().unwrap(), id);
    }

    #[test]
    fn test_from_str_rejects() {
        assert!("".parse::<DeviceId>().is_err());
        assert!("3504175fe00000001000123".parse::<DeviceId>().is_err());
        assert!("3504175fe0000000100012345".parse::<DeviceId>().is_err());
        assert!("g504175fe000000010001234".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_null() {
        assert_eq!(DeviceId::NULL.to_string(), "000000000000000000000000");
    }
}
