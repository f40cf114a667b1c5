//! Wire-level encoding: escaping, the trailing CRC and single-frame
//! transmit. Decoding lives in [`crate::reader`].

use arrayvec::ArrayVec;

use crate::crc::crc16;
use crate::frame::{Frame, ESCAPE, FRAME_START};
use crate::transport::{Error, Transport};

// worst case: every byte but the marker escaped, CRC included
// 1 + 2 * (18 + 2) == 41
pub type WireBytes = ArrayVec<u8, 41>;

fn push_escaped(out: &mut WireBytes, byte: u8) {
    if byte == FRAME_START || byte == ESCAPE {
        out.push(ESCAPE);
        out.push(byte & 0x7F);
    } else {
        out.push(byte);
    }
}

/// Escapes and CRC-terminates a frame, ready for the line.
///
/// The start marker goes out raw; every following byte is subject to
/// escaping. Command frames get the CRC over the unescaped body appended
/// low byte first; tokens carry no CRC.
pub fn encode_frame(frame: &Frame) -> WireBytes {
    let body = frame.to_bytes();
    let mut out = WireBytes::new();
    out.push(body[0]);
    for &byte in &body[1..] {
        push_escaped(&mut out, byte);
    }
    if let Frame::Command(_) = frame {
        let crc = crc16(&body);
        push_escaped(&mut out, (crc & 0xFF) as u8);
        push_escaped(&mut out, (crc >> 8) as u8);
    }
    out
}

/// Transmits one frame.
pub fn put_frame<T: Transport + ?Sized>(line: &mut T, frame: &Frame) -> Result<(), Error> {
    for &byte in &encode_frame(frame) {
        line.write_byte(byte)?;
    }
    Ok(())
}
