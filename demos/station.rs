//! Joins a DS485 bus as a slave station and reports ring activity.
//!
//! Usage: station <serial-device> [device-id]
//!
//! Run with `RUST_LOG=debug` to watch the join handshake frame by frame.

use snafu::ResultExt;
use std::io::{Read, Write};
use std::time::Duration;

use ds485_proto::transport::{self, Transport};
use ds485_proto::{BusDriver, Config, DeviceId};

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

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let port_name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let device_id = match std::env::args().nth(2) {
        Some(arg) => match arg.parse() {
            Ok(id) => id,
            Err(_) => anyhow::bail!("invalid device id: {}", arg),
        },
        None => DeviceId::new(0x3504175fe0000000, 0x0000beef),
    };

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

    let handle = BusDriver::new(SerialLine { port }, Config::new(device_id)).start()?;

    println!("station {} on {}", device_id, port_name);
    let mut last_state = handle.state();
    println!("bus state: {}", last_state);
    loop {
        std::thread::sleep(Duration::from_millis(500));
        let state = handle.state();
        if state != last_state {
            println!("bus state: {} ({} tokens)", state, handle.token_count());
            last_state = state;
        }
    }
}
