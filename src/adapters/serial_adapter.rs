//! Serial transport for the trace controller.
//!
//! Wraps the `serialport` crate behind the [`Transport`] trait. The port is
//! opened with a short internal read timeout (default 100 ms); a read that
//! hits it reports `Ok(0)` so the link layer's deadline loop stays in
//! control of overall latency.

use super::{Transport, TransportFactory};
use anyhow::Context;
use log::debug;
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Internal per-read timeout; the link's deadline loop sits above this.
const CHUNK_TIMEOUT: Duration = Duration::from_millis(100);

/// A live serial connection to the instrument.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open `port_name` at `baud_rate`.
    pub fn open(port_name: &str, baud_rate: u32) -> anyhow::Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(CHUNK_TIMEOUT)
            .open()
            .with_context(|| {
                format!("Failed to open serial port '{port_name}' at {baud_rate} baud")
            })?;

        debug!("Serial port '{}' opened at {} baud", port_name, baud_rate);
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            // Nothing arrived within the internal timeout; let the caller's
            // deadline decide whether to keep waiting.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::All).map_err(io::Error::from)
    }

    fn probe(&mut self) -> io::Result<()> {
        self.port
            .bytes_to_read()
            .map(|_| ())
            .map_err(io::Error::from)
    }
}

/// Factory holding a resolved device address, used for connect and every
/// subsequent reconnect.
#[derive(Debug, Clone)]
pub struct SerialFactory {
    port_name: String,
    baud_rate: u32,
}

impl SerialFactory {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
        }
    }
}

impl TransportFactory for SerialFactory {
    fn open(&self) -> anyhow::Result<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::open(
            &self.port_name,
            self.baud_rate,
        )?))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port_name, self.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_describe() {
        let factory = SerialFactory::new("/dev/ttyACM0", 115_200);
        assert_eq!(factory.describe(), "/dev/ttyACM0 @ 115200 baud");
    }
}
