//! The DS485 frame model: the packed header, the 4-bit command set and the
//! token/command frame split.
//!
//! A frame on the wire is the start marker `0xFD` followed by two packed
//! header bytes. Tokens end there. Command frames continue with a
//! command/length byte, the payload and a CRC-16; the CRC is applied by the
//! wire encoder in [`crate::wire`], not here.

use arrayvec::ArrayVec;
use core::fmt;
use snafu::{ensure, OptionExt, Snafu};

use crate::nom_parser;
use crate::payload::Payload;
use crate::types::{station, Station};

/// Marks the first byte of every frame. Never escaped in that position.
pub const FRAME_START: u8 = 0xFD;
/// Escape byte: the following byte is OR-ed with `0x80` on decode.
pub const ESCAPE: u8 = 0xFC;

/// Error type for this module
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// Header parsing needs the start marker plus two bytes.
    #[snafu(display("Truncated header"))]
    TruncatedHeader,
    /// The 4-bit command code has no assigned meaning.
    #[snafu(display("Unassigned command code {:#04x}", code))]
    UnassignedCommand { code: u8 },
}

/// The frame-type bit of the first header byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Token,
    Command,
}

/// The packed frame header: 6-bit station addresses, broadcast flag and a
/// 2-bit sequence counter. The frame-type bit is not stored here; it derives
/// from the [`Frame`] variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub destination: Station,
    pub source: Station,
    pub broadcast: bool,
    /// Masked to two bits on encode.
    pub counter: u8,
}

impl Header {
    pub fn new(destination: Station, source: Station) -> Self {
        Self {
            destination,
            source,
            broadcast: false,
            counter: 0,
        }
    }

    /// Parses a buffered frame head: start marker at index 0, then the two
    /// packed bytes. The marker byte itself is not inspected.
    ///
    /// # Errors
    /// [`Error::TruncatedHeader`] if fewer than three bytes are given.
    pub fn parse(bytes: &[u8]) -> Result<(Header, FrameKind), Error> {
        ensure!(bytes.len() >= 3, TruncatedHeaderSnafu);
        let raw = nom_parser::header(&bytes[1..3]).context(TruncatedHeaderSnafu)?;
        let kind = if raw.is_command {
            FrameKind::Command
        } else {
            FrameKind::Token
        };
        Ok((
            Header {
                // 6-bit fields, always in range
                destination: station(raw.destination),
                source: station(raw.source),
                broadcast: raw.broadcast,
                counter: raw.counter,
            },
            kind,
        ))
    }

    /// Start marker plus the two packed header bytes.
    pub fn to_bytes(&self, kind: FrameKind) -> [u8; 3] {
        let type_bit = match kind {
            FrameKind::Token => 0,
            FrameKind::Command => 1,
        };
        [
            FRAME_START,
            *self.destination << 2 | (self.broadcast as u8) << 1 | type_bit,
            *self.source << 2 | self.counter & 0x03,
        ]
    }
}

/// The assigned 4-bit command codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    SolicitSuccessorRequestLong = 0x00,
    SolicitSuccessorRequest = 0x01,
    SolicitSuccessorResponse = 0x02,
    GetAddressRequest = 0x03,
    GetAddressResponse = 0x04,
    SetDeviceAddressRequest = 0x05,
    SetDeviceAddressResponse = 0x06,
    SetSuccessorAddressRequest = 0x07,
    SetSuccessorAddressResponse = 0x08,
    Request = 0x09,
    Response = 0x0A,
    Ack = 0x0B,
    Busy = 0x0C,
    Event = 0x0D,
}

impl Command {
    /// # Errors
    /// [`Error::UnassignedCommand`] for the codes `0x0E` and above.
    pub fn from_code(code: u8) -> Result<Self, Error> {
        use Command::*;
        Ok(match code {
            0x00 => SolicitSuccessorRequestLong,
            0x01 => SolicitSuccessorRequest,
            0x02 => SolicitSuccessorResponse,
            0x03 => GetAddressRequest,
            0x04 => GetAddressResponse,
            0x05 => SetDeviceAddressRequest,
            0x06 => SetDeviceAddressResponse,
            0x07 => SetSuccessorAddressRequest,
            0x08 => SetSuccessorAddressResponse,
            0x09 => Request,
            0x0A => Response,
            0x0B => Ack,
            0x0C => Busy,
            0x0D => Event,
            code => return UnassignedCommandSnafu { code }.fail(),
        })
    }

    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Command::*;
        f.write_str(match self {
            SolicitSuccessorRequestLong => "solicit successor request long",
            SolicitSuccessorRequest => "solicit successor request",
            SolicitSuccessorResponse => "solicit successor response",
            GetAddressRequest => "get address request",
            GetAddressResponse => "get address response",
            SetDeviceAddressRequest => "set device address request",
            SetDeviceAddressResponse => "set device address response",
            SetSuccessorAddressRequest => "set successor address request",
            SetSuccessorAddressResponse => "set successor address response",
            Request => "request",
            Response => "response",
            Ack => "ack",
            Busy => "busy",
            Event => "event",
        })
    }
}

/// Where a command frame entered the system.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameOrigin {
    /// Decoded off the serial line.
    Wire,
    /// Injected by a local caller.
    Local,
}

impl Default for FrameOrigin {
    fn default() -> Self {
        FrameOrigin::Local
    }
}

/// A command frame: header, command, payload and an origin tag.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFrame {
    pub header: Header,
    pub command: Command,
    payload: Payload,
    length: Option<u8>,
    origin: FrameOrigin,
}

impl CommandFrame {
    pub fn new(destination: Station, source: Station, command: Command) -> Self {
        Self {
            header: Header::new(destination, source),
            command,
            payload: Payload::new(),
            length: None,
            origin: FrameOrigin::Local,
        }
    }

    /// A broadcast frame; the destination field reads zero.
    pub fn broadcast(source: Station, command: Command) -> Self {
        let mut frame = Self::new(station(0), source, command);
        frame.header.broadcast = true;
        frame
    }

    pub(crate) fn from_wire(header: Header, command: Command, payload: Payload) -> Self {
        Self {
            header,
            command,
            payload,
            length: None,
            origin: FrameOrigin::Wire,
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub const fn origin(&self) -> FrameOrigin {
        self.origin
    }

    pub fn set_origin(&mut self, origin: FrameOrigin) {
        self.origin = origin;
    }

    /// Overrides the value of the 4-bit length field. The payload is still
    /// serialized in full.
    pub fn set_length(&mut self, length: u8) {
        self.length = Some(length);
    }

    /// The value the length field carries on the wire.
    pub fn wire_length(&self) -> u8 {
        self.length.unwrap_or(self.payload.len() as u8)
    }

    fn command_byte(&self) -> u8 {
        self.command.code() << 4 | self.wire_length() & 0x0F
    }
}

// length: marker + 2 header bytes + command/length byte + payload (15) == 19
pub type FrameBytes = ArrayVec<u8, 19>;

/// A decoded frame. The variant is decided once, at decode.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Token(Header),
    Command(CommandFrame),
}

impl Frame {
    pub fn token(destination: Station, source: Station) -> Self {
        Frame::Token(Header::new(destination, source))
    }

    pub fn header(&self) -> &Header {
        match self {
            Frame::Token(header) => header,
            Frame::Command(frame) => &frame.header,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Token(_) => FrameKind::Token,
            Frame::Command(_) => FrameKind::Command,
        }
    }

    /// The unescaped frame body, CRC not included.
    pub fn to_bytes(&self) -> FrameBytes {
        let mut bytes = FrameBytes::new();
        match self {
            Frame::Token(header) => {
                bytes.extend(header.to_bytes(FrameKind::Token));
            }
            Frame::Command(frame) => {
                bytes.extend(frame.header.to_bytes(FrameKind::Command));
                bytes.push(frame.command_byte());
                bytes.try_extend_from_slice(frame.payload.as_bytes())
                    .expect("BUG: frame buffer too small.");
            }
        }
        bytes
    }
}

impl From<CommandFrame> for Frame {
    fn from(frame: CommandFrame) -> Self {
        Frame::Command(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, CommandFrame, Frame, FrameKind, Header};
    use crate::types::station;

    #[test]
    fn header_round_trip() {
        let mut header = Header::new(station(5), station(9));
        header.broadcast = true;
        header.counter = 2;
        let bytes = header.to_bytes(FrameKind::Command);
        assert_eq!(bytes, [0xFD, 5 << 2 | 0b11, 9 << 2 | 2]);

        let (parsed, kind) = Header::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(kind, FrameKind::Command);

        let bytes = Header::new(station(0x3F), station(0)).to_bytes(FrameKind::Token);
        let (parsed, kind) = Header::parse(&bytes).unwrap();
        assert_eq!(kind, FrameKind::Token);
        assert_eq!(parsed.destination, 0x3F);
        assert!(!parsed.broadcast);
    }

    #[test]
    fn header_truncated() {
        assert!(Header::parse(&[0xFD, 0x01]).is_err());
        assert!(Header::parse(&[]).is_err());
    }

    #[test]
    fn command_codes() {
        for code in 0..=0x0D {
            assert_eq!(Command::from_code(code).unwrap().code(), code);
        }
        assert!(Command::from_code(0x0E).is_err());
        assert!(Command::from_code(0x0F).is_err());
        assert_eq!(Command::Ack.to_string(), "ack");
    }

    #[test]
    fn command_frame_bytes() {
        let mut frame =
            CommandFrame::new(station(0), station(0), Command::SolicitSuccessorRequest);
        frame.header.counter = 3;
        for &b in &[0xBB, 0x01, 0x00, 0x00] {
            frame.payload_mut().add_u8(b).unwrap();
        }
        assert_eq!(
            Frame::from(frame).to_bytes().as_slice(),
            [0xFD, 0x01, 0x03, 0x14, 0xBB, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn token_bytes() {
        let token = Frame::token(station(7), station(3));
        assert_eq!(token.to_bytes().as_slice(), [0xFD, 7 << 2, 3 << 2]);
    }

    #[test]
    fn length_override() {
        let mut frame = CommandFrame::new(station(1), station(2), Command::Response);
        frame.payload_mut().add_u16(0xAABB).unwrap();
        assert_eq!(frame.wire_length(), 2);
        frame.set_length(5);
        assert_eq!(frame.wire_length(), 5);
        let bytes = Frame::from(frame).to_bytes();
        assert_eq!(bytes[3], 0xA5);
        // payload still serialized in full
        assert_eq!(&bytes[4..], [0xBB, 0xAA]);
    }
}
