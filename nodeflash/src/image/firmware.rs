use super::{checksum, CHECKSUM_SEED};
use crate::Error;
use deku::prelude::*;
use std::str::FromStr;

pub const IMAGE_MAGIC: u8 = 0xE9;
pub const MAX_SEGMENTS: usize = 16;
pub const MAX_SEGMENT_SIZE: u32 = 0x10000;

// Load addresses accepted on decode: DRAM/IRAM up to the start of mapped flash.
const SEGMENT_ADDR_MIN: u32 = 0x3ff0_0000;
const SEGMENT_ADDR_MAX: u32 = 0x4020_0000;

const HEADER_LEN: usize = 8;
const SEGMENT_HEADER_LEN: usize = 8;

#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct ImageHeader {
    magic: u8,
    segment_count: u8,
    flash_mode: u8,
    flash_size_freq: u8,
    entry: u32,
}

#[derive(Debug, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct SegmentHeader {
    addr: u32,
    size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub addr: u32,
    pub data: Vec<u8>,
}

/// The ROM bootable image: a list of segments copied into RAM before the
/// entrypoint is called.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    pub flash_mode: u8,
    pub flash_size_freq: u8,
    pub entry: u32,
    pub segments: Vec<Segment>,
}

impl FirmwareImage {
    pub fn new(entry: u32) -> Self {
        FirmwareImage {
            entry,
            ..Default::default()
        }
    }

    pub fn set_flash_params(&mut self, mode: FlashMode, size: FlashSize, freq: FlashFreq) {
        self.flash_mode = mode as u8;
        self.flash_size_freq = size as u8 | freq as u8;
    }

    /// Appends a segment, padding it to a word boundary. Empty data is ignored.
    pub fn add_segment(&mut self, addr: u32, mut data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        data.resize(align_word(data.len()), 0);
        self.segments.push(Segment { addr, data });
    }

    /// Checksum over the data of all segments.
    pub fn checksum(&self) -> u8 {
        self.segments
            .iter()
            .fold(CHECKSUM_SEED, |state, seg| checksum(&seg.data, state))
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        if self.segments.len() > MAX_SEGMENTS {
            return Err(Error::InvalidImage("more than 16 segments"));
        }
        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            segment_count: self.segments.len() as u8,
            flash_mode: self.flash_mode,
            flash_size_freq: self.flash_size_freq,
            entry: self.entry,
        };
        let mut out = header.to_bytes()?;

        let mut state = CHECKSUM_SEED;
        for seg in &self.segments {
            let mut data = seg.data.clone();
            data.resize(align_word(data.len()), 0);
            let seg_header = SegmentHeader {
                addr: seg.addr,
                size: data.len() as u32,
            };
            out.extend(seg_header.to_bytes()?);
            out.extend(&data);
            state = checksum(&data, state);
        }

        // the checksum is the last byte of a 16 byte aligned file
        let padding = 15 - out.len() % 16;
        out.resize(out.len() + padding, 0);
        out.push(state);

        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self::decode_with_checksum(bytes)?.0)
    }

    /// Decodes an image, also returning the checksum byte stored in it.
    pub fn decode_with_checksum(bytes: &[u8]) -> Result<(Self, u8), Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidImage("truncated header"));
        }
        let (_, header) = ImageHeader::from_bytes((bytes, 0))?;
        if header.magic != IMAGE_MAGIC {
            return Err(Error::InvalidImage("bad magic"));
        }
        if header.segment_count as usize > MAX_SEGMENTS {
            return Err(Error::InvalidImage("more than 16 segments"));
        }

        let mut image = FirmwareImage {
            flash_mode: header.flash_mode,
            flash_size_freq: header.flash_size_freq,
            entry: header.entry,
            segments: Vec::with_capacity(header.segment_count as usize),
        };
        let mut offset = HEADER_LEN;
        for _ in 0..header.segment_count {
            let raw = bytes
                .get(offset..offset + SEGMENT_HEADER_LEN)
                .ok_or(Error::InvalidImage("truncated segment header"))?;
            let (_, seg) = SegmentHeader::from_bytes((raw, 0))?;
            offset += SEGMENT_HEADER_LEN;

            // the segment count is the only end marker, so reject anything
            // that does not look like a real segment
            if seg.addr < SEGMENT_ADDR_MIN
                || seg.addr > SEGMENT_ADDR_MAX
                || seg.size > MAX_SEGMENT_SIZE
            {
                return Err(Error::SuspiciousSegment {
                    addr: seg.addr,
                    size: seg.size,
                });
            }
            let data = bytes
                .get(offset..offset + seg.size as usize)
                .ok_or(Error::InvalidImage("truncated segment data"))?;
            offset += data.len();
            image.segments.push(Segment {
                addr: seg.addr,
                data: data.to_vec(),
            });
        }

        let stored = *bytes
            .get(offset + 15 - offset % 16)
            .ok_or(Error::InvalidImage("missing checksum"))?;

        Ok((image, stored))
    }
}

fn align_word(len: usize) -> usize {
    (len + 3) & !3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlashMode {
    Qio = 0,
    Qout = 1,
    Dio = 2,
    Dout = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlashSize {
    Mbit4 = 0x00,
    Mbit2 = 0x10,
    Mbit8 = 0x20,
    Mbit16 = 0x30,
    Mbit32 = 0x40,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlashFreq {
    Mhz40 = 0x0,
    Mhz26 = 0x1,
    Mhz20 = 0x2,
    Mhz80 = 0xf,
}

impl FromStr for FlashMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "qio" => FlashMode::Qio,
            "qout" => FlashMode::Qout,
            "dio" => FlashMode::Dio,
            "dout" => FlashMode::Dout,
            _ => return Err(format!("unknown flash mode {}", s)),
        })
    }
}

impl FromStr for FlashSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "4m" => FlashSize::Mbit4,
            "2m" => FlashSize::Mbit2,
            "8m" => FlashSize::Mbit8,
            "16m" => FlashSize::Mbit16,
            "32m" => FlashSize::Mbit32,
            _ => return Err(format!("unknown flash size {}", s)),
        })
    }
}

impl FromStr for FlashFreq {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "40m" => FlashFreq::Mhz40,
            "26m" => FlashFreq::Mhz26,
            "20m" => FlashFreq::Mhz20,
            "80m" => FlashFreq::Mhz80,
            _ => return Err(format!("unknown flash frequency {}", s)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_segments() -> FirmwareImage {
        let mut image = FirmwareImage::new(0x4010_0004);
        image.add_segment(0x4010_0000, (0..100u8).collect());
        image.add_segment(0x3ffb_0000, vec![0xa5; 40]);
        image.add_segment(0x3ffc_0000, vec![0x11; 10]);
        image
    }

    #[test]
    fn three_segment_layout() {
        let image = three_segments();
        let bytes = image.encode().unwrap();

        // header, 3 segment headers, 100 + 40 + 12 bytes of data, padding to
        // the checksum byte ending a 16 byte aligned file
        assert_eq!(bytes.len(), 192);
        assert_eq!(&bytes[..4], &[IMAGE_MAGIC, 3, 0, 0]);
        assert_eq!(&bytes[4..8], &0x4010_0004u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &[0x00, 0x00, 0x10, 0x40, 100, 0, 0, 0]);

        let (decoded, stored) = FirmwareImage::decode_with_checksum(&bytes).unwrap();
        assert_eq!(decoded.segments.len(), 3);
        let sizes: Vec<usize> = decoded.segments.iter().map(|s| s.data.len()).collect();
        assert_eq!(sizes, vec![100, 40, 12]);
        assert_eq!(stored, decoded.checksum());
        assert_eq!(decoded, image);
    }

    #[test]
    fn flash_params_round_trip() {
        let mut image = three_segments();
        image.set_flash_params(FlashMode::Dio, FlashSize::Mbit32, FlashFreq::Mhz80);
        assert_eq!(image.flash_mode, 2);
        assert_eq!(image.flash_size_freq, 0x4f);
        let decoded = FirmwareImage::decode(&image.encode().unwrap()).unwrap();
        assert_eq!(decoded, image);
    }

    #[test]
    fn empty_image_checksum_is_seed() {
        let bytes = FirmwareImage::new(0).encode().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[15], CHECKSUM_SEED);
    }

    #[test]
    fn corrupted_checksum_is_detected() {
        let image = three_segments();
        let mut bytes = image.encode().unwrap();
        bytes[40] ^= 0xff;
        let (decoded, stored) = FirmwareImage::decode_with_checksum(&bytes).unwrap();
        assert_ne!(decoded.checksum(), stored);
    }

    #[test]
    fn add_segment_pads_and_skips_empty() {
        let mut image = FirmwareImage::new(0);
        image.add_segment(0x3ffe_8000, vec![]);
        image.add_segment(0x3ffe_8000, vec![1, 2, 3, 4, 5]);
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.segments[0].data, vec![1, 2, 3, 4, 5, 0, 0, 0]);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = three_segments().encode().unwrap();
        bytes[0] = 0xea;
        assert!(matches!(
            FirmwareImage::decode(&bytes),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn rejects_too_many_segments() {
        let mut bytes = three_segments().encode().unwrap();
        bytes[1] = 17;
        assert!(matches!(
            FirmwareImage::decode(&bytes),
            Err(Error::InvalidImage(_))
        ));

        let mut image = FirmwareImage::new(0);
        for i in 0..17 {
            image.add_segment(0x3ffe_8000 + i * 4, vec![0; 4]);
        }
        assert!(image.encode().is_err());
    }

    #[test]
    fn rejects_suspicious_segments() {
        let mut low = FirmwareImage::new(0);
        low.add_segment(0x2000_0000, vec![0; 4]);
        assert!(matches!(
            FirmwareImage::decode(&low.encode().unwrap()),
            Err(Error::SuspiciousSegment {
                addr: 0x2000_0000,
                size: 4
            })
        ));

        let mut big = FirmwareImage::new(0);
        big.add_segment(0x3ffe_8000, vec![0; 0x10004]);
        assert!(matches!(
            FirmwareImage::decode(&big.encode().unwrap()),
            Err(Error::SuspiciousSegment { size: 0x10004, .. })
        ));
    }

    #[test]
    fn rejects_truncated() {
        let bytes = three_segments().encode().unwrap();
        assert!(FirmwareImage::decode(&bytes[..4]).is_err());
        assert!(FirmwareImage::decode(&bytes[..60]).is_err());
        assert!(matches!(
            FirmwareImage::decode(&bytes[..bytes.len() - 1]),
            Err(Error::InvalidImage("missing checksum"))
        ));
    }

    #[test]
    fn parses_flash_params() {
        assert_eq!("QIO".parse::<FlashMode>().unwrap(), FlashMode::Qio);
        assert_eq!("16m".parse::<FlashSize>().unwrap(), FlashSize::Mbit16);
        assert_eq!("26m".parse::<FlashFreq>().unwrap(), FlashFreq::Mhz26);
        assert!("66m".parse::<FlashFreq>().is_err());
    }
}
