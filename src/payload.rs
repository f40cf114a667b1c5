//! Command frame payloads. A payload is an opaque byte string on the wire;
//! senders append typed values and receivers read them back in order with a
//! [`PayloadDissector`].
//!
//! Multi-byte integers travel little-endian (a u32 as two 16-bit words, low
//! word first). Device ids travel big-endian, upper part first.

use arrayvec::ArrayVec;
use snafu::{ensure, OptionExt, Snafu};

use crate::types::DeviceId;

/// Payload capacity of a command frame. The frame header carries the length
/// in a 4-bit field.
pub const MAX_PAYLOAD: usize = 15;

/// Error type for this module
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// The value does not fit in the remaining payload space.
    #[snafu(display("Payload capacity exceeded"))]
    Overflow,
    /// A read past the end of the payload.
    #[snafu(display("Payload exhausted"))]
    Exhausted,
}

const fn overflow() -> OverflowSnafu {
    OverflowSnafu
}

const fn exhausted() -> ExhaustedSnafu {
    ExhaustedSnafu
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    data: ArrayVec<u8, MAX_PAYLOAD>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies `bytes` into a fresh payload.
    /// # Errors
    /// Returns [`Error::Overflow`] if `bytes` is longer than [`MAX_PAYLOAD`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let mut data = ArrayVec::new();
        data.try_extend_from_slice(bytes).ok().with_context(overflow)?;
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn add_u8(&mut self, value: u8) -> Result<(), Error> {
        ensure!(self.data.remaining_capacity() >= 1, overflow());
        self.data.push(value);
        Ok(())
    }

    pub fn add_u16(&mut self, value: u16) -> Result<(), Error> {
        ensure!(self.data.remaining_capacity() >= 2, overflow());
        self.data.extend(value.to_le_bytes());
        Ok(())
    }

    /// Two little-endian 16-bit words, low word first.
    pub fn add_u32(&mut self, value: u32) -> Result<(), Error> {
        ensure!(self.data.remaining_capacity() >= 4, overflow());
        self.add_u16((value & 0xFFFF) as u16)?;
        self.add_u16((value >> 16) as u16)
    }

    /// Twelve bytes: 8-byte upper part big-endian, 4-byte lower part
    /// big-endian.
    pub fn add_device_id(&mut self, id: DeviceId) -> Result<(), Error> {
        ensure!(self.data.remaining_capacity() >= 12, overflow());
        self.data.extend(id.upper().to_be_bytes());
        self.data.extend(id.lower().to_be_bytes());
        Ok(())
    }

    pub fn dissector(&self) -> PayloadDissector<'_> {
        PayloadDissector {
            data: &self.data,
            pos: 0,
        }
    }
}

/// Reads typed values back out of a payload, front to back.
#[derive(Debug)]
pub struct PayloadDissector<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadDissector<'a> {
    pub fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        ensure!(self.pos + n <= self.data.len(), exhausted());
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        let low = self.read_u16()? as u32;
        let high = self.read_u16()? as u32;
        Ok(high << 16 | low)
    }

    pub fn read_device_id(&mut self) -> Result<DeviceId, Error> {
        let b = self.take(8)?;
        let mut upper = [0u8; 8];
        upper.copy_from_slice(b);
        let b = self.take(4)?;
        let mut lower = [0u8; 4];
        lower.copy_from_slice(b);
        Ok(DeviceId::new(
            u64::from_be_bytes(upper),
            u32::from_be_bytes(lower),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{Payload, MAX_PAYLOAD};
    use crate::types::DeviceId;

    #[test]
    fn test_sizes() {
        let mut p = Payload::new();
        p.add_u8(0xAB).unwrap();
        assert_eq!(p.len(), 1);
        p.add_u16(0x1234).unwrap();
        assert_eq!(p.len(), 3);
        p.add_u32(0xDEAD_BEEF).unwrap();
        assert_eq!(p.len(), 7);

        let mut p = Payload::new();
        p.add_device_id(DeviceId::new(1, 2)).unwrap();
        assert_eq!(p.len(), 12);
    }

    #[test]
    fn test_byte_order() {
        let mut p = Payload::new();
        p.add_u16(0x1234).unwrap();
        assert_eq!(p.as_bytes(), [0x34, 0x12]);

        let mut p = Payload::new();
        p.add_u32(0xDEAD_BEEF).unwrap();
        assert_eq!(p.as_bytes(), [0xEF, 0xBE, 0xAD, 0xDE]);

        let mut p = Payload::new();
        p.add_device_id(DeviceId::new(0x0102030405060708, 0x0A0B0C0D))
            .unwrap();
        assert_eq!(
            p.as_bytes(),
            [1, 2, 3, 4, 5, 6, 7, 8, 0x0A, 0x0B, 0x0C, 0x0D]
        );
    }

    #[test]
    fn test_dissect() {
        let id = DeviceId::new(0x3504175fe0000000, 0x10001234);
        let mut p = Payload::new();
        p.add_u8(0x42).unwrap();
        p.add_u16(0xBEEF).unwrap();
        p.add_u32(0x1234_5678).unwrap();

        let mut d = p.dissector();
        assert_eq!(d.read_u8().unwrap(), 0x42);
        assert_eq!(d.read_u16().unwrap(), 0xBEEF);
        assert_eq!(d.read_u32().unwrap(), 0x1234_5678);
        assert!(d.is_empty());
        assert!(d.read_u8().is_err());

        let mut p = Payload::new();
        p.add_device_id(id).unwrap();
        assert_eq!(p.dissector().read_device_id().unwrap(), id);
    }

    #[test]
    fn test_overflow() {
        let mut p = Payload::new();
        for _ in 0..MAX_PAYLOAD {
            p.add_u8(0).unwrap();
        }
        assert!(p.add_u8(0).is_err());
        assert!(p.add_u16(0).is_err());
        assert_eq!(p.len(), MAX_PAYLOAD);

        // a partial fit must not write anything
        let mut p = Payload::new();
        for _ in 0..14 {
            p.add_u8(0).unwrap();
        }
        assert!(p.add_u16(0xFFFF).is_err());
        assert_eq!(p.len(), 14);

        assert!(Payload::from_slice(&[0; 16]).is_err());
    }
}
