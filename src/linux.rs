use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{DebugLog, HalTransport, NoLog, Options, Programmer, SerialPort};

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }
}

fn io_kind(e: SerialError) -> IoErrorKind {
    std::io::Error::from(e).kind()
}

/// Transport over a linux serial port
pub type LinuxTransport = HalTransport<Serial, Delay, IoErrorKind>;

impl Programmer<LinuxTransport> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        Self::linux_with_log(port, baud, options, NoLog)
    }
}

impl <L: DebugLog> Programmer<LinuxTransport, L> {
    /// Create a new linux serial port programmer instance with a diagnostic output hook
    pub fn linux_with_log<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
        log: L,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        debug!("Opened serial port at {} baud", baud);

        // Return instance
        let transport = HalTransport::new(port, Delay {}, options.poll_delay_ms);
        Ok(Self::with_log(transport, options, log))
    }
}
