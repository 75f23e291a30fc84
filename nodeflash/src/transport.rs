use crate::Result;
use serial::{BaudRate, SerialPort, SerialPortSettings};
use std::{
    io::{self, Read, Write},
    thread::sleep,
    time::Duration,
};

/// A blocking, byte transparent line to the ROM bootloader.
///
/// RTS drives CH_PD (reset), DTR drives GPIO0.
pub trait Port: Read + Write {
    fn set_rts(&mut self, level: bool) -> Result<()>;
    fn set_dtr(&mut self, level: bool) -> Result<()>;
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
    fn timeout(&self) -> Duration;
    fn sleep(&self, duration: Duration) {
        sleep(duration)
    }
}

pub struct SerialTransport(Box<dyn SerialPort>);

impl SerialTransport {
    /// Opens `port` as 8N1 at `baud_rate`.
    pub fn open(port: &str, baud_rate: usize) -> Result<Self> {
        let mut serial = serial::open(port)?;
        let speed = BaudRate::from_speed(baud_rate);
        serial.reconfigure(&|setup: &mut dyn SerialPortSettings| {
            setup.set_baud_rate(speed)?;
            setup.set_char_size(serial::Bits8);
            setup.set_parity(serial::ParityNone);
            setup.set_stop_bits(serial::Stop1);
            setup.set_flow_control(serial::FlowNone);
            Ok(())
        })?;
        Ok(SerialTransport(Box::new(serial)))
    }
}

impl Port for SerialTransport {
    fn set_rts(&mut self, level: bool) -> Result<()> {
        Ok(self.0.set_rts(level)?)
    }
    fn set_dtr(&mut self, level: bool) -> Result<()> {
        Ok(self.0.set_dtr(level)?)
    }
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        Ok(self.0.set_timeout(timeout)?)
    }
    fn timeout(&self) -> Duration {
        self.0.timeout()
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
