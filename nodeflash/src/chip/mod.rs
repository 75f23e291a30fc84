mod esp8266;

pub use esp8266::Esp8266;

/// A machine code payload run from RAM to do what the ROM loader can not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stub {
    pub code: &'static [u8],
    pub load_addr: u32,
    pub entry: u32,
}

pub trait Chip {
    /// Stub streaming flash contents back over the serial link. Its first
    /// three words are patched with (offset, chunk size, chunk count).
    fn flash_read_stub(&self) -> Stub;
    /// ROM routine erasing the whole flash chip.
    fn chip_erase_entry(&self) -> u32;
    /// RAM address the erase jump is staged at.
    fn chip_erase_load_addr(&self) -> u32;
    /// Registers holding the factory programmed MAC address.
    fn mac_registers(&self) -> [u32; 2];
    fn mac_address(&self, words: [u32; 2]) -> [u8; 6];
}
