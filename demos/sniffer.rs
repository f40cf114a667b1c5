//! Prints every frame seen on a DS485 bus, with inter-frame timing.
//!
//! Usage: sniffer <serial-device>

use snafu::ResultExt;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use ds485_proto::transport::{self, Transport};
use ds485_proto::{Frame, FrameReader};

struct SerialLine {
    port: Box<dyn serialport::SerialPort>,
}

impl Transport for SerialLine {
    fn reset(&mut self) -> Result<(), transport::Error> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(std::io::Error::from)
            .context(transport::OpenSnafu)
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, transport::Error> {
        self.port
            .set_timeout(timeout.max(Duration::from_millis(1)))
            .map_err(std::io::Error::from)
            .context(transport::ReadSnafu)?;
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e).context(transport::ReadSnafu),
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), transport::Error> {
        self.port.write_all(&[byte]).context(transport::WriteSnafu)
    }
}

fn print_frame(frame: &Frame, gap: Duration) {
    match frame {
        Frame::Token(header) => println!(
            "{:>6} ms  token  {} -> {}",
            gap.as_millis(),
            header.source,
            header.destination
        ),
        Frame::Command(frame) => {
            let header = &frame.header;
            print!(
                "{:>6} ms  {}  {} -> {}{}",
                gap.as_millis(),
                frame.command,
                header.source,
                header.destination,
                if header.broadcast { " (broadcast)" } else { "" }
            );
            for byte in frame.payload().as_bytes() {
                print!(" {:02x}", byte);
            }
            println!();
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let port_name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let port = match serialport::new(&port_name, 115_200)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(Duration::from_millis(50))
        .open()
    {
        Ok(port) => port,
        Err(e) => anyhow::bail!("failed to open {}: {}", port_name, e),
    };

    let mut line = SerialLine { port };
    let mut reader = FrameReader::new();
    let mut last_frame = Instant::now();

    println!("listening on {}", port_name);
    loop {
        if let Some(frame) = reader.get_frame(&mut line, Duration::from_millis(250))? {
            let gap = last_frame.elapsed();
            last_frame = Instant::now();
            print_frame(&frame, gap);
        }
    }
}
