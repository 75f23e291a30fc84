//! SLIP framing used on the ROM bootloader serial link.
//!
//! Every frame is bounded by [`END`]. An `END` or `ESC` byte inside the
//! payload is sent as a two byte escape sequence.

use crate::{Error, Result};
use std::io::{self, Read};

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Wraps `payload` in delimiters, escaping it on the way.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(END);
    for &b in payload {
        match b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(b),
        }
    }
    out.push(END);
    out
}

/// Reads the payload of a frame whose opening delimiter was already consumed,
/// up to (not including) the closing delimiter.
pub fn decode<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    loop {
        match read_byte(reader)? {
            END => return Ok(payload),
            ESC => match read_byte(reader)? {
                ESC_END => payload.push(END),
                ESC_ESC => payload.push(ESC),
                other => return Err(Error::InvalidEscape(other)),
            },
            b => payload.push(b),
        }
    }
}

/// Skips line noise up to the next delimiter and reads one non-empty frame.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    while read_byte(reader)? != END {}
    loop {
        let payload = decode(reader)?;
        // back-to-back delimiters: the second one opens the frame
        if !payload.is_empty() {
            return Ok(payload);
        }
    }
}

fn read_byte<R: Read + ?Sized>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    match reader.read_exact(&mut byte) {
        Ok(()) => Ok(byte[0]),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(Error::Timeout),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn escapes_delimiter_and_escape() {
        let framed = encode(&[0x01, END, 0x02, ESC, 0x03]);
        assert_eq!(
            framed,
            vec![END, 0x01, ESC, ESC_END, 0x02, ESC, ESC_ESC, 0x03, END]
        );
    }

    #[test]
    fn unframes_what_was_framed() {
        let payload: Vec<u8> = (0..=255u8).chain([END, END, ESC, ESC].iter().copied()).collect();
        let mut cursor = Cursor::new(encode(&payload));
        assert_eq!(read_frame(&mut cursor).unwrap(), payload);
    }

    #[test]
    fn stops_at_first_delimiter() {
        let mut stream = encode(&[1, 2, 3]);
        stream.extend(encode(&[4, 5]));
        let mut cursor = Cursor::new(stream);
        assert_eq!(read_frame(&mut cursor).unwrap(), vec![1, 2, 3]);
        assert_eq!(read_frame(&mut cursor).unwrap(), vec![4, 5]);
    }

    #[test]
    fn skips_noise_and_empty_frames() {
        let mut stream = vec![0x55, 0x12, END, END];
        stream.extend(&[9, 8, END]);
        let mut cursor = Cursor::new(stream);
        assert_eq!(read_frame(&mut cursor).unwrap(), vec![9, 8]);
    }

    #[test]
    fn rejects_unknown_escape() {
        let mut cursor = Cursor::new(vec![END, 0x01, ESC, 0x42, END]);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(Error::InvalidEscape(0x42))
        ));
    }

    #[test]
    fn truncated_stream_is_io_error() {
        let mut cursor = Cursor::new(vec![END, 0x01, 0x02]);
        assert!(matches!(read_frame(&mut cursor), Err(Error::IO(_))));
    }
}
