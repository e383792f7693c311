use std::io::{self, Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

// Short read timeout so the engine loop stays responsive; idle reads come
// back as Ok(0) and the loop moves on to its timers.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Byte transport under the transaction engine. Implemented for real serial
/// ports below; tests drive the engine through an in-memory implementation.
pub trait SerialLink: Send {
    /// Read whatever is pending; Ok(0) when nothing arrived within the
    /// link's short poll interval.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write a complete frame in one go.
    fn write_all_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Drain the TX direction; RS-485 drivers must be done sending before
    /// the line is relinquished.
    fn flush_tx(&mut self) -> io::Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn write_all_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)
    }

    fn flush_tx(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Open a serial port with the FFU bus line discipline: 8 data bits, no
/// parity, two stop bits, no flow control.
pub fn open_ffu_port(port_name: &str, baud: u32) -> Result<Box<dyn SerialPort>> {
    serialport::new(port_name, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::Two)
        .flow_control(FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open()
        .with_context(|| format!("failed to open serial port {port_name} at {baud} baud"))
}
