//! Serial transport to a target device
//!
//! The [Transport] trait abstracts over a bidirectional byte stream to a
//! physical device, plus the DTR/RTS control lines used to reset it or
//! drop it into download mode. [SerialTransport] is the real
//! implementation on top of a system serial port; tests substitute
//! scripted implementations.

use std::{io, time::Duration};

use log::debug;
use serialport::{FlowControl, SerialPort};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, VariantNames};

use crate::Error;

pub mod reset;

/// USB PID of the integrated USB-JTAG-Serial peripheral found on newer
/// Espressif chips, which needs its own reset sequence.
pub const USB_SERIAL_JTAG_PID: u16 = 0x1001;

/// Timeout applied to a freshly opened port. Kept short so that read
/// loops can observe a cancellation signal within one read cycle.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Baud rates selectable for the serial console.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumIter,
    EnumString,
    VariantNames,
    clap::ValueEnum,
)]
#[non_exhaustive]
pub enum BaudRate {
    #[strum(serialize = "9600")]
    #[value(name = "9600")]
    B9600,
    #[strum(serialize = "19200")]
    #[value(name = "19200")]
    B19200,
    #[strum(serialize = "38400")]
    #[value(name = "38400")]
    B38400,
    #[strum(serialize = "57600")]
    #[value(name = "57600")]
    B57600,
    #[default]
    #[strum(serialize = "115200")]
    #[value(name = "115200")]
    B115200,
    #[strum(serialize = "230400")]
    #[value(name = "230400")]
    B230400,
    #[strum(serialize = "460800")]
    #[value(name = "460800")]
    B460800,
    #[strum(serialize = "921600")]
    #[value(name = "921600")]
    B921600,
}

impl BaudRate {
    /// The rate in bits per second.
    pub fn bps(self) -> u32 {
        match self {
            BaudRate::B9600 => 9_600,
            BaudRate::B19200 => 19_200,
            BaudRate::B38400 => 38_400,
            BaudRate::B57600 => 57_600,
            BaudRate::B115200 => 115_200,
            BaudRate::B230400 => 230_400,
            BaudRate::B460800 => 460_800,
            BaudRate::B921600 => 921_600,
        }
    }

    /// The variant matching a rate in bits per second, if any.
    pub fn from_bps(bps: u32) -> Option<Self> {
        BaudRate::iter().find(|rate| rate.bps() == bps)
    }
}

/// A bidirectional byte stream to a physical device.
///
/// `read` returns `Ok(0)` when the read timed out without data, so that
/// callers polling in a loop can check for cancellation between cycles.
/// All other failures surface as typed [Error]s; callers must treat a
/// [Error::PortUnavailable] as retryable only after an explicit user
/// action, never silently.
pub trait Transport: Send {
    /// Read the next chunk of bytes, waiting at most the configured
    /// timeout. Returns the number of bytes read, `0` on timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Write all of `data` to the device.
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Flush any buffered output.
    fn flush(&mut self) -> Result<(), Error>;

    /// Drive the DTR and RTS control lines.
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<(), Error>;

    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;

    /// The currently configured read timeout.
    fn timeout(&self) -> Duration;

    /// Change the baud rate of the underlying stream.
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error>;

    /// The current baud rate of the underlying stream.
    fn baud_rate(&self) -> Result<u32, Error>;

    /// Name of the underlying port, if it has one.
    fn name(&self) -> Option<String>;
}

/// [Transport] implementation on top of a system serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open the named serial port at the given baud rate.
    pub fn open(name: &str, baud: BaudRate) -> Result<Self, Error> {
        debug!("Opening serial port '{}' at {} baud", name, baud);

        let port = serialport::new(name, baud.bps())
            .flow_control(FlowControl::None)
            .timeout(DEFAULT_READ_TIMEOUT)
            .open()
            .map_err(|e| Error::PortUnavailable(name.into(), e))?;

        Ok(SerialTransport { port })
    }

    /// Wrap an already opened serial port.
    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        SerialTransport { port }
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self.port.read(buf) {
            Ok(count) => Ok(count),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(Error::Read(e)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        self.port.write_all(data).map_err(Error::Write)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.port.flush().map_err(Error::Write)
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<(), Error> {
        self.port
            .write_data_terminal_ready(dtr)
            .and_then(|_| self.port.write_request_to_send(rts))
            .map_err(Error::ControlLines)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port.set_timeout(timeout).map_err(Error::SerialConfig)
    }

    fn timeout(&self) -> Duration {
        self.port.timeout()
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
        self.port.set_baud_rate(baud).map_err(Error::SerialConfig)
    }

    fn baud_rate(&self) -> Result<u32, Error> {
        self.port.baud_rate().map_err(Error::SerialConfig)
    }

    fn name(&self) -> Option<String> {
        self.port.name()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn baud_rates_cover_the_selectable_set() {
        let rates: Vec<u32> = BaudRate::iter().map(BaudRate::bps).collect();
        assert_eq!(
            rates,
            [9_600, 19_200, 38_400, 57_600, 115_200, 230_400, 460_800, 921_600]
        );
    }

    #[test]
    fn baud_rate_parses_and_displays_as_plain_numbers() {
        assert_eq!(BaudRate::from_str("115200").unwrap(), BaudRate::B115200);
        assert_eq!(BaudRate::B921600.to_string(), "921600");
        assert_eq!(BaudRate::default(), BaudRate::B115200);
    }
}
