//! Bit-level parsers for the packed wire bytes. Surfaced through
//! [`Header::parse`](crate::frame::Header::parse), not used directly.

use nom::bits::{bits, complete::take};
use nom::error::Error;
use nom::IResult;

/// Field values of the two packed header bytes, still unvalidated.
#[derive(Debug, PartialEq)]
pub(crate) struct RawHeader {
    pub destination: u8,
    pub broadcast: bool,
    pub is_command: bool,
    pub source: u8,
    pub counter: u8,
}

type BitInput<'a> = (&'a [u8], usize);

// byte 0: destination(6) broadcast(1) type(1), byte 1: source(6) counter(2)
fn packed_header(i: BitInput) -> IResult<BitInput, RawHeader> {
    let (i, destination) = take(6usize)(i)?;
    let (i, broadcast): (_, u8) = take(1usize)(i)?;
    let (i, is_command): (_, u8) = take(1usize)(i)?;
    let (i, source) = take(6usize)(i)?;
    let (i, counter) = take(2usize)(i)?;
    Ok((
        i,
        RawHeader {
            destination,
            broadcast: broadcast != 0,
            is_command: is_command != 0,
            source,
            counter,
        },
    ))
}

/// Parses the two header bytes following the start marker.
pub(crate) fn header(input: &[u8]) -> Option<RawHeader> {
    let parsed: IResult<&[u8], RawHeader> =
        bits::<_, _, Error<BitInput>, _, _>(packed_header)(input);
    parsed.ok().map(|(_rest, raw)| raw)
}

/// Splits the command/length byte into (command code, payload length).
pub(crate) fn command_byte(byte: u8) -> (u8, u8) {
    (byte >> 4 & 0x0F, byte & 0x0F)
}

#[cfg(test)]
mod tests {
    use super::{command_byte, header};

    #[test]
    fn header_bit_layout() {
        // dest 5, broadcast, command bit, src 9, counter 2
        let raw = header(&[5 << 2 | 0b10 | 0b01, 9 << 2 | 2]).unwrap();
        assert_eq!(raw.destination, 5);
        assert!(raw.broadcast);
        assert!(raw.is_command);
        assert_eq!(raw.source, 9);
        assert_eq!(raw.counter, 2);

        let raw = header(&[0x3F << 2, 0]).unwrap();
        assert_eq!(raw.destination, 0x3F);
        assert!(!raw.broadcast);
        assert!(!raw.is_command);
        assert_eq!(raw.source, 0);
        assert_eq!(raw.counter, 0);
    }

    #[test]
    fn header_too_short() {
        assert!(header(&[]).is_none());
        assert!(header(&[0x01]).is_none());
    }

    #[test]
    fn command_byte_nibbles() {
        assert_eq!(command_byte(0x14), (0x01, 0x04));
        assert_eq!(command_byte(0xD0), (0x0D, 0x00));
        assert_eq!(command_byte(0xAF), (0x0A, 0x0F));
    }
}
