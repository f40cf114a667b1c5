//! Incremental decoder for the wire format.
//!
//! [`FrameReader::feed`] consumes one raw byte at a time and yields a frame
//! when one completes; [`FrameReader::get_frame`] drives `feed` from a
//! [`Transport`] until a deadline. Bad input never produces an error, only
//! counter bumps and a resynchronization.

use arrayvec::ArrayVec;
use log::{info, warn};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::crc::crc16;
use crate::frame::{Command, CommandFrame, Frame, Header, ESCAPE, FRAME_START};
use crate::nom_parser;
use crate::payload::Payload;
use crate::transport::{self, Transport};

// Bytes buffered for one frame before a forced resync.
const RECEIVE_BUFFER_BYTES: usize = 50;
// Granularity of the byte polls inside get_frame.
const BYTE_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Copy, Clone, PartialEq)]
enum ReadState {
    Synchronizing,
    ReadingHeader,
    ReadingPacket,
    ReadingCrc,
}

/// Decoder diagnostics, shared across threads. Informational only; control
/// flow never consults them.
#[derive(Debug, Default)]
pub struct ReaderStats {
    frames_received: AtomicU32,
    incomplete_frames: AtomicU32,
    crc_errors: AtomicU32,
}

impl ReaderStats {
    /// Complete, CRC-valid frames decoded.
    pub fn frames_received(&self) -> u32 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Deadlines that hit while a partial frame sat in the buffer.
    pub fn incomplete_frames(&self) -> u32 {
        self.incomplete_frames.load(Ordering::Relaxed)
    }

    /// Command frames dropped for a non-zero CRC remainder.
    pub fn crc_errors(&self) -> u32 {
        self.crc_errors.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct FrameReader {
    state: ReadState,
    buffer: ArrayVec<u8, RECEIVE_BUFFER_BYTES>,
    escape_next: bool,
    message_length: Option<usize>,
    stats: Arc<ReaderStats>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        FrameReader {
            state: ReadState::Synchronizing,
            buffer: ArrayVec::new(),
            escape_next: false,
            message_length: None,
            stats: Arc::new(ReaderStats::default()),
        }
    }

    /// Shared handle to the diagnostics counters.
    pub fn stats(&self) -> Arc<ReaderStats> {
        Arc::clone(&self.stats)
    }

    fn mid_frame(&self) -> bool {
        self.state != ReadState::Synchronizing && !self.buffer.is_empty()
    }

    /// Drops any partial frame and resynchronizes on the next frame start.
    pub fn restart(&mut self) {
        self.state = ReadState::Synchronizing;
        self.buffer.clear();
        self.message_length = None;
    }

    /// Feed one raw wire byte. Returns a frame when one completes.
    pub fn feed(&mut self, byte: u8) -> Option<Frame> {
        if byte == ESCAPE {
            self.escape_next = true;
            return None;
        }
        let escaped = self.escape_next;
        self.escape_next = false;
        let byte = if escaped { byte | 0x80 } else { byte };

        // An unescaped frame start begins a new frame, wherever it shows up.
        // An 0xFD produced by unescaping is data.
        if byte == FRAME_START && !escaped {
            self.restart();
        }

        self.buffer.push(byte);
        if self.buffer.len() == RECEIVE_BUFFER_BYTES {
            info!("ds485: receive buffer overflowing, resyncing");
            self.restart();
            return None;
        }

        match self.state {
            ReadState::Synchronizing => {
                if byte == FRAME_START {
                    self.state = ReadState::ReadingHeader;
                }
            }
            ReadState::ReadingHeader => {
                if self.buffer.len() == 3 {
                    // type bit of the first header byte
                    if self.buffer[1] & 0x01 != 0 {
                        self.state = ReadState::ReadingPacket;
                        self.message_length = None;
                    } else {
                        return self.emit_token();
                    }
                }
            }
            ReadState::ReadingPacket => {
                if self.message_length.is_none() && self.buffer.len() >= 4 {
                    self.message_length = Some((self.buffer[3] & 0x0F) as usize);
                }
                if let Some(len) = self.message_length {
                    if self.buffer.len() == len + 4 {
                        self.state = ReadState::ReadingCrc;
                    }
                }
            }
            ReadState::ReadingCrc => {
                if let Some(len) = self.message_length {
                    if self.buffer.len() == len + 6 {
                        return self.emit_command(len);
                    }
                }
            }
        }
        None
    }

    fn emit_token(&mut self) -> Option<Frame> {
        let parsed = Header::parse(&self.buffer).ok();
        self.restart();
        ReaderStats::bump(&self.stats.frames_received);
        let (header, _kind) = parsed?;
        Some(Frame::Token(header))
    }

    fn emit_command(&mut self, len: usize) -> Option<Frame> {
        if crc16(&self.buffer) != 0 {
            warn!("ds485: CRC mismatch, dropping frame");
            ReaderStats::bump(&self.stats.crc_errors);
            self.restart();
            return None;
        }
        let parsed = Header::parse(&self.buffer).ok();
        let (code, _) = nom_parser::command_byte(self.buffer[3]);
        let payload = Payload::from_slice(&self.buffer[4..4 + len]).ok();
        self.restart();
        ReaderStats::bump(&self.stats.frames_received);

        let (header, _kind) = parsed?;
        let command = match Command::from_code(code) {
            Ok(command) => command,
            Err(err) => {
                warn!("ds485: dropping frame: {}", err);
                return None;
            }
        };
        Some(Frame::Command(CommandFrame::from_wire(
            header, command, payload?,
        )))
    }

    /// Pulls bytes from `line` until a frame completes or `timeout` passes.
    /// A deadline hit with a partial frame buffered counts one incomplete
    /// frame.
    pub fn get_frame<T: Transport + ?Sized>(
        &mut self,
        line: &mut T,
        timeout: Duration,
    ) -> Result<Option<Frame>, transport::Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                if self.mid_frame() {
                    ReaderStats::bump(&self.stats.incomplete_frames);
                }
                return Ok(None);
            }
            if let Some(byte) = line.read_byte(BYTE_POLL)? {
                if let Some(frame) = self.feed(byte) {
                    return Ok(Some(frame));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FrameReader;
    use crate::crc::crc16;
    use crate::frame::{Command, Frame};
    use crate::transport::testing::ScriptedLine;
    use std::time::Duration;

    fn feed_all(reader: &mut FrameReader, bytes: &[u8]) -> Vec<Frame> {
        bytes.iter().filter_map(|&b| reader.feed(b)).collect()
    }

    /// Appends the CRC over `body`, low byte first.
    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut bytes = body.to_vec();
        let crc = crc16(body);
        bytes.push((crc & 0xFF) as u8);
        bytes.push((crc >> 8) as u8);
        bytes
    }

    #[test]
    fn decode_token() {
        let mut reader = FrameReader::new();
        let frames = feed_all(&mut reader, &[0xFD, 7 << 2, 3 << 2]);
        match frames.as_slice() {
            [Frame::Token(header)] => {
                assert_eq!(header.destination, 7);
                assert_eq!(header.source, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(reader.stats().frames_received(), 1);
    }

    #[test]
    fn decode_command() {
        let mut reader = FrameReader::new();
        let wire = with_crc(&[0xFD, 0x01, 0x03, 0x14, 0xBB, 0x01, 0x00, 0x00]);
        let frames = feed_all(&mut reader, &wire);
        match frames.as_slice() {
            [Frame::Command(frame)] => {
                assert_eq!(frame.command, Command::SolicitSuccessorRequest);
                assert_eq!(frame.header.destination, 0);
                assert_eq!(frame.header.counter, 3);
                assert_eq!(frame.payload().as_bytes(), [0xBB, 0x01, 0x00, 0x00]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn resync_on_garbage_and_restart() {
        let mut reader = FrameReader::new();
        // noise, a frame cut short by a new start marker, then a clean token
        let mut wire = vec![0x12, 0x99, 0x00, 0xFD, 0x01, 0x03, 0x14];
        wire.extend([0xFD, 5 << 2, 1 << 2]);
        let frames = feed_all(&mut reader, &wire);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Token(header) => assert_eq!(header.destination, 5),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(reader.stats().frames_received(), 1);
        assert_eq!(reader.stats().incomplete_frames(), 0);
    }

    #[test]
    fn crc_mismatch_counts_and_recovers() {
        let mut reader = FrameReader::new();
        let mut wire = with_crc(&[0xFD, 0x01, 0x03, 0x14, 0xBB, 0x01, 0x00, 0x00]);
        wire[4] ^= 0xFF; // corrupt one payload byte, keep the CRC
        assert!(feed_all(&mut reader, &wire).is_empty());
        assert_eq!(reader.stats().crc_errors(), 1);
        assert_eq!(reader.stats().frames_received(), 0);

        let wire = with_crc(&[0xFD, 0x01, 0x03, 0x14, 0xBB, 0x01, 0x00, 0x00]);
        assert_eq!(feed_all(&mut reader, &wire).len(), 1);
        assert_eq!(reader.stats().frames_received(), 1);
    }

    #[test]
    fn escaped_data_byte() {
        let mut reader = FrameReader::new();
        // payload byte 0xFD travels as 0xFC 0x7D and must not resync
        let body = [0xFD, 0x02 << 2 | 0x01, 0x01 << 2, 0xA1, 0xFD];
        let framed = with_crc(&body);
        let mut wire = Vec::new();
        for (i, &b) in framed.iter().enumerate() {
            if i > 0 && (b == 0xFD || b == 0xFC) {
                wire.push(0xFC);
                wire.push(b & 0x7F);
            } else {
                wire.push(b);
            }
        }
        let frames = feed_all(&mut reader, &wire);
        match frames.as_slice() {
            [Frame::Command(frame)] => {
                assert_eq!(frame.command, Command::Response);
                assert_eq!(frame.payload().as_bytes(), [0xFD]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn synchronizing_overflow_resyncs() {
        let mut reader = FrameReader::new();
        let noise = [0x55u8; 120];
        assert!(feed_all(&mut reader, &noise).is_empty());
        let wire = [0xFD, 1 << 2, 2 << 2];
        assert_eq!(feed_all(&mut reader, &wire).len(), 1);
    }

    #[test]
    fn get_frame_counts_incomplete() {
        let mut reader = FrameReader::new();
        let mut line = ScriptedLine::with_bytes(&[0xFD, 0x01, 0x03]);
        let got = reader
            .get_frame(&mut line, Duration::from_millis(10))
            .unwrap();
        assert!(got.is_none());
        assert_eq!(reader.stats().incomplete_frames(), 1);

        // the partial frame completes on the next pull
        let full = with_crc(&[0xFD, 0x01, 0x03, 0x14, 0xBB, 0x01, 0x00, 0x00]);
        line.rx.extend(full[3..].iter().copied());
        let got = reader
            .get_frame(&mut line, Duration::from_millis(50))
            .unwrap();
        assert!(matches!(got, Some(Frame::Command(_))));
        assert_eq!(reader.stats().frames_received(), 1);

        line.fail_reads = true;
        assert!(reader
            .get_frame(&mut line, Duration::from_millis(5))
            .is_err());
    }
}
