#![macro_use]

use crate::{slip, transport::Port, Error, RomError};
use byteorder::{LittleEndian, WriteBytesExt};
use deku::prelude::*;
use std::io::{Cursor, Write};
use std::time::Duration;

pub const DEFAULT_BAUDRATE: usize = 115200;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const DIRECTION_REQUEST: u8 = 0x00;
const DIRECTION_RESPONSE: u8 = 0x01;
const RESPONSE_HEADER_LEN: usize = 8;

macro_rules! impl_command(
    ($id: expr, $t:ty) => (
        impl Command for $t {
            const CMD_ID: u8 = $id;
        }
    );
    ($id: expr, $t:ty, checksum) => (
        impl Command for $t {
            const CMD_ID: u8 = $id;

            fn checksum(&self) -> u32 {
                crate::image::checksum(&self.data, crate::image::CHECKSUM_SEED) as u32
            }
        }
    );
);

pub trait Command: DekuContainerWrite {
    const CMD_ID: u8;
    fn checksum(&self) -> u32 {
        0
    }
}

#[derive(Debug, DekuRead)]
#[deku(endian = "little")]
struct ResponseHeader {
    direction: u8,
    op: u8,
    len: u16,
    value: u32,
}

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub op: u8,
    pub value: u32,
    pub body: Vec<u8>,
}

impl Response {
    pub fn status(&self) -> RomError {
        RomError::from_body(&self.body)
    }
}

pub struct Connection {
    port: Box<dyn Port>,
}

impl Connection {
    pub fn new(port: Box<dyn Port>) -> Self {
        Connection { port }
    }

    /// Pulses CH_PD while GPIO0 is held low so the chip boots into the ROM
    /// serial loader.
    pub fn reset_to_flash(&mut self) -> Result<(), Error> {
        self.port.set_rts(true)?;
        self.port.set_dtr(true)?;
        self.sleep(Duration::from_millis(50));
        self.port.set_rts(false)?;
        self.sleep(Duration::from_millis(50));
        self.port.set_dtr(false)?;
        self.sleep(Duration::from_millis(50));

        Ok(())
    }

    pub fn sleep(&self, duration: Duration) {
        self.port.sleep(duration)
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port.set_timeout(timeout)
    }

    pub fn with_timeout<T, F: FnMut(&mut Connection) -> Result<T, Error>>(
        &mut self,
        timeout: Duration,
        mut f: F,
    ) -> Result<T, Error> {
        let old_timeout = self.port.timeout();
        self.port.set_timeout(timeout)?;
        let result = f(self);
        self.port.set_timeout(old_timeout)?;
        result
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.port.write_all(&slip::encode(payload))?;
        Ok(self.port.flush()?)
    }

    pub fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        slip::read_frame(&mut self.port)
    }

    /// Reads one response frame. When `op` is given the response must answer
    /// that command.
    pub fn read_response(&mut self, op: Option<u8>) -> Result<Response, Error> {
        let frame = self.read_frame()?;
        log::trace!("response frame: {:x?}", frame);
        if frame.len() < RESPONSE_HEADER_LEN {
            return Err(Error::RespError);
        }
        let (_, header) = ResponseHeader::from_bytes((frame.as_slice(), 0))?;
        if header.direction != DIRECTION_RESPONSE || op.map_or(false, |op| op != header.op) {
            return Err(Error::RespError);
        }
        let body = &frame[RESPONSE_HEADER_LEN..];
        if body.len() < header.len as usize {
            return Err(Error::InvalidFrame {
                expected: header.len as usize,
                actual: body.len(),
            });
        }

        Ok(Response {
            op: header.op,
            value: header.value,
            body: body[..header.len as usize].to_vec(),
        })
    }

    pub fn command<C: Command>(&mut self, command: C) -> Result<Response, Error> {
        let req = self.to_cmd(command)?;
        log::trace!("request frame: {:x?}", &req[..req.len().min(16)]);
        self.write_frame(&req)?;
        self.read_response(Some(C::CMD_ID))
    }

    fn to_cmd<C: Command>(&self, command: C) -> Result<Vec<u8>, Error> {
        let data = Vec::new();
        let mut writer = Cursor::new(data);
        let body = command.to_bytes()?;
        let len = body.len() as u16;

        writer.write_u8(DIRECTION_REQUEST)?;
        writer.write_u8(C::CMD_ID)?;
        writer.write_u16::<LittleEndian>(len)?;
        writer.write_u32::<LittleEndian>(command.checksum())?;
        writer.write_all(&body)?;

        Ok(writer.into_inner())
    }
}
