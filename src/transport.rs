//! The serial line abstraction. The bus controller drives exactly one
//! transport, always from its own thread. Real buses are RS-485 ttys at
//! 115200 8N1 (see `demos/`); tests wire up in-memory implementations.

use snafu::Snafu;
use std::time::Duration;

/// Error type for this module
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[non_exhaustive]
pub enum Error {
    /// Opening or reopening the device failed.
    #[snafu(display("Failed to open serial device: {}", source))]
    Open { source: std::io::Error },
    /// A read failed for a reason other than a timeout.
    #[snafu(display("Serial read failed: {}", source))]
    Read { source: std::io::Error },
    /// A write failed.
    #[snafu(display("Serial write failed: {}", source))]
    Write { source: std::io::Error },
}

/// One attachment to the bus.
pub trait Transport {
    /// Opens or reopens the device. Called once before the controller
    /// starts and again while recovering from a communication error.
    fn reset(&mut self) -> Result<(), Error>;

    /// Reads a single byte, waiting at most `timeout` for one to arrive.
    /// `Ok(None)` means the timeout passed without data.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, Error>;

    /// Writes a single byte.
    fn write_byte(&mut self, byte: u8) -> Result<(), Error>;
}

/// Watches the line for up to `window` and reports whether any byte arrived.
/// The byte itself is discarded; the frame reader resynchronizes on the next
/// frame start anyway.
pub fn sense_traffic<T: Transport + ?Sized>(
    line: &mut T,
    window: Duration,
) -> Result<bool, Error> {
    Ok(line.read_byte(window)?.is_some())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{Error, ReadSnafu, Transport};
    use snafu::ResultExt;
    use std::collections::VecDeque;
    use std::io;
    use std::time::Duration;

    /// Replays a canned byte script; writes are captured.
    #[derive(Default)]
    pub struct ScriptedLine {
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
        pub fail_reads: bool,
    }

    impl ScriptedLine {
        pub fn with_bytes(bytes: &[u8]) -> Self {
            ScriptedLine {
                rx: bytes.iter().copied().collect(),
                ..ScriptedLine::default()
            }
        }
    }

    impl Transport for ScriptedLine {
        fn reset(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, Error> {
            if self.fail_reads {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected fault"))
                    .context(ReadSnafu);
            }
            match self.rx.pop_front() {
                Some(byte) => Ok(Some(byte)),
                None => {
                    std::thread::sleep(timeout);
                    Ok(None)
                }
            }
        }

        fn write_byte(&mut self, byte: u8) -> Result<(), Error> {
            self.tx.push(byte);
            Ok(())
        }
    }

    #[test]
    fn sense() {
        let mut line = ScriptedLine::with_bytes(&[0x42]);
        assert!(super::sense_traffic(&mut line, Duration::from_millis(1)).unwrap());
        assert!(!super::sense_traffic(&mut line, Duration::from_millis(1)).unwrap());

        line.fail_reads = true;
        assert!(super::sense_traffic(&mut line, Duration::from_millis(1)).is_err());
    }
}
