use super::{Chip, Stub};

const OTP_MAC0: u32 = 0x3ff0_0050;
const OTP_MAC1: u32 = 0x3ff0_0054;
/// Espressif OUI, the part of the MAC not stored in OTP.
const MAC_OUI: [u8; 3] = [0x18, 0xfe, 0x34];

const STUB_LOAD_ADDR: u32 = 0x4010_0000;
const STUB_ENTRY: u32 = 0x4010_001c;
const ROM_ERASE_CHIP: u32 = 0x4000_4984;

/// Reads `count` chunks of `chunk` bytes starting at `offset` and sends each
/// one as its own SLIP frame. The three leading zero words are the
/// parameters.
const FLASH_READ_STUB: &[u8] = &[
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x80, 0x3c, 0x00, 0x40, 0x1c, 0x4b, 0x00, 0x40, 0x21, 0x11, 0x00, 0x40, //
    0x00, 0x80, 0xfe, 0x3f, 0xc1, 0xfb, 0xff, 0xd1, 0xf8, 0xff, 0x2d, 0x0d, //
    0x31, 0xfd, 0xff, 0x41, 0xf7, 0xff, 0x4a, 0xdd, 0x51, 0xf9, 0xff, 0xc0, //
    0x05, 0x00, 0x21, 0xf9, 0xff, 0x31, 0xf3, 0xff, 0x41, 0xf5, 0xff, 0xc0, //
    0x04, 0x00, 0x0b, 0xcc, 0x56, 0xec, 0xfd, 0x06, 0xff, 0xff, 0x00, 0x00, //
];

#[derive(Copy, Clone, Debug, Default)]
pub struct Esp8266;

impl Chip for Esp8266 {
    fn flash_read_stub(&self) -> Stub {
        Stub {
            code: FLASH_READ_STUB,
            load_addr: STUB_LOAD_ADDR,
            entry: STUB_ENTRY,
        }
    }

    fn chip_erase_entry(&self) -> u32 {
        ROM_ERASE_CHIP
    }

    fn chip_erase_load_addr(&self) -> u32 {
        STUB_LOAD_ADDR
    }

    fn mac_registers(&self) -> [u32; 2] {
        [OTP_MAC0, OTP_MAC1]
    }

    fn mac_address(&self, [mac0, mac1]: [u32; 2]) -> [u8; 6] {
        [
            MAC_OUI[0],
            MAC_OUI[1],
            MAC_OUI[2],
            (mac1 >> 8) as u8,
            mac1 as u8,
            (mac0 >> 24) as u8,
        ]
    }
}
