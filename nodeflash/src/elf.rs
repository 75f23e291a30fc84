use std::borrow::Cow;

use xmas_elf::sections::SectionData;
use xmas_elf::symbol_table::Entry;
use xmas_elf::ElfFile;

use crate::image::{partition::FLASH_BASE_ADDR, FirmwareImage};
use crate::{Error, Result};

/// Sections the ROM copies into RAM, with the symbols giving their load
/// address.
const RAM_SECTIONS: [(&str, &str); 3] = [
    (".data", "_data_start"),
    (".text", "_text_start"),
    (".rodata", "_rodata_start"),
];
const IROM_SECTION: &str = ".irom0.text";
const IROM_START: &str = "_irom0_text_start";

/// Symbol addresses and section contents of a linked firmware.
pub trait SymbolSource {
    fn entry(&self) -> u32;
    fn symbol_addr(&self, name: &str) -> Result<u32>;
    fn section(&self, name: &str) -> Result<Cow<'_, [u8]>>;
}

pub struct ElfImage<'a> {
    elf: ElfFile<'a>,
}

impl<'a> ElfImage<'a> {
    pub fn from_data(data: &'a [u8]) -> Result<Self> {
        let elf = ElfFile::new(data).map_err(|_| Error::InvalidElf)?;
        Ok(ElfImage { elf })
    }
}

impl SymbolSource for ElfImage<'_> {
    fn entry(&self) -> u32 {
        self.elf.header.pt2.entry_point() as u32
    }

    fn symbol_addr(&self, name: &str) -> Result<u32> {
        for section in self.elf.section_iter() {
            if let Ok(SectionData::SymbolTable32(entries)) = section.get_data(&self.elf) {
                if let Some(entry) = entries
                    .iter()
                    .find(|entry| entry.get_name(&self.elf) == Ok(name))
                {
                    return Ok(entry.value() as u32);
                }
            }
        }
        Err(Error::MissingSymbol(name.to_string()))
    }

    fn section(&self, name: &str) -> Result<Cow<'_, [u8]>> {
        let section = self
            .elf
            .find_section_by_name(name)
            .ok_or_else(|| Error::MissingSection(name.to_string()))?;
        Ok(Cow::Borrowed(section.raw_data(&self.elf)))
    }
}

/// A segment of data to write to the flash
pub struct RomSegment<'a> {
    pub addr: u32,
    pub data: Cow<'a, [u8]>,
}

impl<'a> RomSegment<'a> {
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
    pub fn from_slice(addr: u32, data: &'a [u8]) -> RomSegment<'a> {
        RomSegment {
            addr,
            data: Cow::Borrowed(data),
        }
    }
}

/// Builds the bootable image from the RAM sections of `source`, and returns
/// it with the flash mapped code placed at its flash offset.
pub fn elf2image<S: SymbolSource>(source: &S) -> Result<(FirmwareImage, RomSegment<'_>)> {
    let mut image = FirmwareImage::new(source.entry());
    for (section, symbol) in RAM_SECTIONS.iter() {
        let addr = source.symbol_addr(symbol)?;
        image.add_segment(addr, source.section(section)?.into_owned());
    }

    let irom_addr = source
        .symbol_addr(IROM_START)?
        .checked_sub(FLASH_BASE_ADDR)
        .ok_or(Error::InvalidElf)?;
    let irom = RomSegment {
        addr: irom_addr,
        data: source.section(IROM_SECTION)?,
    };

    Ok((image, irom))
}

/// Lays `image` at flash offset 0 and `irom` after it, filling the gap with
/// erased flash.
pub fn combine(image: &[u8], irom: &RomSegment) -> Result<Vec<u8>> {
    let offset = irom.addr as usize;
    if image.len() > offset {
        return Err(Error::InvalidImage("image overlaps flash mapped code"));
    }
    let mut out = image.to_vec();
    out.resize(offset, 0xFF);
    out.extend_from_slice(&irom.data);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeSource {
        symbols: HashMap<&'static str, u32>,
        sections: HashMap<&'static str, Vec<u8>>,
    }

    impl SymbolSource for FakeSource {
        fn entry(&self) -> u32 {
            0x4010_0004
        }

        fn symbol_addr(&self, name: &str) -> Result<u32> {
            self.symbols
                .get(name)
                .copied()
                .ok_or_else(|| Error::MissingSymbol(name.to_string()))
        }

        fn section(&self, name: &str) -> Result<Cow<'_, [u8]>> {
            self.sections
                .get(name)
                .map(|data| Cow::Borrowed(data.as_slice()))
                .ok_or_else(|| Error::MissingSection(name.to_string()))
        }
    }

    fn source() -> FakeSource {
        let symbols = vec![
            ("_text_start", 0x4010_0000),
            ("_data_start", 0x3ffe_8000),
            ("_rodata_start", 0x3ffe_8100),
            ("_irom0_text_start", 0x4021_0000),
        ];
        let sections = vec![
            (".text", vec![0x11; 6]),
            (".data", vec![0x22; 8]),
            (".rodata", vec![]),
            (".irom0.text", vec![0x33; 32]),
        ];
        FakeSource {
            symbols: symbols.into_iter().collect(),
            sections: sections.into_iter().collect(),
        }
    }

    #[test]
    fn builds_image_and_irom() {
        let source = source();
        let (image, irom) = elf2image(&source).unwrap();
        assert_eq!(image.entry, 0x4010_0004);
        let addrs: Vec<u32> = image.segments.iter().map(|s| s.addr).collect();
        assert_eq!(addrs, vec![0x3ffe_8000, 0x4010_0000]);
        assert_eq!(image.segments[0].data, vec![0x22; 8]);
        assert_eq!(image.segments[1].data.len(), 8);
        assert_eq!(irom.addr, 0x10000);
        assert_eq!(irom.size(), 32);
    }

    #[test]
    fn missing_symbol_is_reported() {
        let mut source = source();
        source.symbols.remove("_data_start");
        assert!(matches!(
            elf2image(&source),
            Err(Error::MissingSymbol(name)) if name == "_data_start"
        ));
    }

    #[test]
    fn combined_fills_gap() {
        let irom = RomSegment::from_slice(0x20, &[1, 2]);
        let out = combine(&[9; 16], &irom).unwrap();
        assert_eq!(out.len(), 0x22);
        assert!(out[16..0x20].iter().all(|&b| b == 0xFF));
        assert_eq!(&out[0x20..], &[1, 2]);

        assert!(combine(&[9; 0x21], &irom).is_err());
    }

    #[test]
    fn rejects_non_elf() {
        assert!(matches!(
            ElfImage::from_data(&[0u8; 64]),
            Err(Error::InvalidElf)
        ));
    }
}
