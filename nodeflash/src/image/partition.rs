use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Flash offset of the record page holding the partition table.
pub const PARTITION_PAGE_OFFSET: u32 = 0x10000;
pub const FLASH_PAGE_SIZE: u32 = 0x1000;
/// Address at which flash is mapped into the CPU address space.
pub const FLASH_BASE_ADDR: u32 = 0x4020_0000;
pub const DEFAULT_FLASH_SIZE: u32 = 4 * 1024 * 1024;
/// On-flash SPIFFS size meaning "all remaining flash".
pub const SPIFFS_USE_ALL: u32 = 0xFFFF_FFFF;

const PARTITION_ALIGN: u32 = 2 * FLASH_PAGE_SIZE;
const SPIFFS_BOUNDARY: u32 = 0x10_0000;
const DEFAULT_SPIFFS_SIZE: u32 = FLASH_PAGE_SIZE;

const RCR_DELETED: u8 = 0x00;
const RCR_PT: u8 = 0x01;
const RCR_FREE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    RfCal,
    PhyData,
    SystemParameter,
    EagleRom,
    Irom0Text,
    Lfs0,
    Lfs1,
    TlsCert,
    Spiffs0,
    Spiffs1,
    Unknown(u32),
}

impl From<u32> for PartitionType {
    fn from(raw: u32) -> Self {
        match raw {
            4 => PartitionType::RfCal,
            5 => PartitionType::PhyData,
            6 => PartitionType::SystemParameter,
            101 => PartitionType::EagleRom,
            102 => PartitionType::Irom0Text,
            103 => PartitionType::Lfs0,
            104 => PartitionType::Lfs1,
            105 => PartitionType::TlsCert,
            106 => PartitionType::Spiffs0,
            107 => PartitionType::Spiffs1,
            _ => PartitionType::Unknown(raw),
        }
    }
}

impl From<PartitionType> for u32 {
    fn from(kind: PartitionType) -> Self {
        match kind {
            PartitionType::RfCal => 4,
            PartitionType::PhyData => 5,
            PartitionType::SystemParameter => 6,
            PartitionType::EagleRom => 101,
            PartitionType::Irom0Text => 102,
            PartitionType::Lfs0 => 103,
            PartitionType::Lfs1 => 104,
            PartitionType::TlsCert => 105,
            PartitionType::Spiffs0 => 106,
            PartitionType::Spiffs1 => 107,
            PartitionType::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionType::RfCal => "RF_CAL",
            PartitionType::PhyData => "PHY_DATA",
            PartitionType::SystemParameter => "SYSTEM_PARAMETER",
            PartitionType::EagleRom => "EAGLEROM",
            PartitionType::Irom0Text => "IROM0TEXT",
            PartitionType::Lfs0 => "LFS0",
            PartitionType::Lfs1 => "LFS1",
            PartitionType::TlsCert => "TLSCERT",
            PartitionType::Spiffs0 => "SPIFFS0",
            PartitionType::Spiffs1 => "SPIFFS1",
            PartitionType::Unknown(raw) => return write!(f, "Type {}", raw),
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub kind: PartitionType,
    pub addr: u32,
    pub size: u32,
}

impl Partition {
    pub fn new(kind: PartitionType, addr: u32, size: u32) -> Self {
        Partition { kind, addr, size }
    }

    pub fn end(&self) -> u32 {
        self.addr.saturating_add(self.size)
    }
}

/// One tagged record of a record page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: u8,
    pub words: Vec<u32>,
}

/// The page of configuration records stored in flash.
///
/// Each record starts with a tag word holding the length in words (low byte)
/// and the record type (second byte). A length byte of 0xFF marks the free
/// tail of the page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPage {
    pub records: Vec<Record>,
}

impl RecordPage {
    /// Decodes a page, dropping deleted records.
    pub fn decode(page: &[u8]) -> Result<Self> {
        let words: Vec<u32> = page
            .chunks_exact(4)
            .map(LittleEndian::read_u32)
            .collect();

        let mut records = Vec::new();
        let mut i = 0;
        while i < words.len() {
            let len = (words[i] & 0xff) as u8;
            if len == RCR_FREE {
                break;
            }
            let kind = ((words[i] >> 8) & 0xff) as u8;
            let end = i + 1 + len as usize;
            let payload = words
                .get(i + 1..end)
                .ok_or(Error::RecordPageOverflow(end * 4))?;
            if kind != RCR_DELETED {
                records.push(Record {
                    kind,
                    words: payload.to_vec(),
                });
            }
            i = end;
        }

        Ok(RecordPage { records })
    }

    /// Encodes the records into a full page, filling the tail with the free
    /// sentinel.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut page = Vec::with_capacity(FLASH_PAGE_SIZE as usize);
        for record in &self.records {
            if record.words.len() >= RCR_FREE as usize {
                return Err(Error::RecordPageOverflow(record.words.len() * 4));
            }
            let tag = (record.kind as u32) << 8 | record.words.len() as u32;
            for word in std::iter::once(tag).chain(record.words.iter().copied()) {
                let mut buf = [0u8; 4];
                LittleEndian::write_u32(&mut buf, word);
                page.extend_from_slice(&buf);
            }
        }
        if page.len() > FLASH_PAGE_SIZE as usize {
            return Err(Error::RecordPageOverflow(page.len()));
        }
        page.resize(FLASH_PAGE_SIZE as usize, RCR_FREE);

        Ok(page)
    }

    fn partition_record(&self) -> Result<usize> {
        let mut found = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.kind == RCR_PT)
            .map(|(i, _)| i);
        match (found.next(), found.next()) {
            (Some(i), None) => Ok(i),
            _ => Err(Error::MissingPartitionTable),
        }
    }

    pub fn partition_table(&self) -> Result<PartitionTable> {
        let index = self.partition_record()?;
        PartitionTable::from_words(&self.records[index].words)
    }

    /// Replaces the partition table record in place.
    pub fn set_partition_table(&mut self, table: &PartitionTable) -> Result<()> {
        let index = self.partition_record()?;
        self.records[index].words = table.to_words();
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    pub entries: Vec<Partition>,
    /// Address carried by the legacy `(0, imageEnd, 0)` end marker.
    pub image_end: Option<u32>,
}

impl PartitionTable {
    pub fn from_words(words: &[u32]) -> Result<Self> {
        if words.len() % 3 != 0 {
            return Err(Error::PartitionLayout {
                index: words.len() / 3,
                reason: "truncated partition entry".to_string(),
            });
        }
        let mut entries: Vec<Partition> = words
            .chunks_exact(3)
            .map(|t| Partition::new(t[0].into(), t[1], t[2]))
            .collect();

        let image_end = match entries.last() {
            Some(marker) if marker.kind == PartitionType::Unknown(0) => {
                let end = marker.addr;
                entries.pop();
                Some(end)
            }
            _ => None,
        };

        Ok(PartitionTable { entries, image_end })
    }

    pub fn to_words(&self) -> Vec<u32> {
        let mut words: Vec<u32> = self
            .entries
            .iter()
            .flat_map(|p| vec![p.kind.into(), p.addr, p.size])
            .collect();
        if let Some(end) = self.image_end {
            words.extend_from_slice(&[0, end, 0]);
        }
        words
    }

    pub fn find(&self, kind: PartitionType) -> Option<&Partition> {
        self.entries.iter().find(|p| p.kind == kind)
    }

    fn position(&self, kind: PartitionType) -> Option<usize> {
        self.entries.iter().position(|p| p.kind == kind)
    }
}

/// Requested size of the SPIFFS partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiffsSize {
    Bytes(u32),
    /// Everything from the SPIFFS start address to the end of flash.
    UseAll,
}

impl SpiffsSize {
    fn from_raw(raw: u32) -> Self {
        if raw == SPIFFS_USE_ALL {
            SpiffsSize::UseAll
        } else {
            SpiffsSize::Bytes(raw)
        }
    }
}

/// Explicit placement requests; `None` keeps what the table says.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayoutOverrides {
    pub lfs_addr: Option<u32>,
    pub lfs_size: Option<u32>,
    pub spiffs_addr: Option<u32>,
    pub spiffs_size: Option<SpiffsSize>,
}

impl LayoutOverrides {
    /// An LFS partition is created when missing only if it is being sized.
    fn lfs_requested(&self) -> bool {
        self.lfs_size.is_some()
    }
}

/// Rounds up to the partition granularity of two flash pages.
fn align_partition(n: u32) -> Option<u32> {
    n.checked_add(PARTITION_ALIGN - 1)
        .map(|v| v & !(PARTITION_ALIGN - 1))
}

fn layout_error(index: usize, reason: impl Into<String>) -> Error {
    Error::PartitionLayout {
        index,
        reason: reason.into(),
    }
}

/// Resolves addresses and sizes of every partition for a flash of
/// `flash_size` bytes.
///
/// Partitions are resolved in table order, each depending only on the ones
/// before it. Zero sized partitions are dropped, as is the legacy end marker.
pub fn layout(
    table: &PartitionTable,
    overrides: &LayoutOverrides,
    flash_size: u32,
) -> Result<PartitionTable> {
    let mut table = table.clone();

    if overrides.lfs_requested() && table.position(PartitionType::Lfs0).is_none() {
        if let Some(i) = table.position(PartitionType::Irom0Text) {
            table
                .entries
                .insert(i + 1, Partition::new(PartitionType::Lfs0, 0, 0));
        }
    }

    if table.position(PartitionType::Spiffs0).is_none() {
        let at = table
            .position(PartitionType::Lfs0)
            .or_else(|| table.position(PartitionType::Irom0Text))
            .map(|i| i + 1)
            .unwrap_or(table.entries.len());
        table.entries.insert(
            at,
            Partition::new(PartitionType::Spiffs0, 0, DEFAULT_SPIFFS_SIZE),
        );
    }

    let image_end = table
        .image_end
        .map(|end| end.checked_sub(FLASH_BASE_ADDR).unwrap_or(end));

    let mut last_end = 0u32;
    let mut placed = Vec::with_capacity(table.entries.len());
    for (index, entry) in table.entries.iter().enumerate() {
        let Partition {
            kind,
            mut addr,
            mut size,
        } = *entry;

        match kind {
            PartitionType::Irom0Text if size == 0 => {
                let end = image_end
                    .ok_or_else(|| layout_error(index, "cannot size IROM0TEXT without an image end marker"))?;
                size = end
                    .checked_sub(addr)
                    .and_then(align_partition)
                    .ok_or_else(|| layout_error(index, "image ends before IROM0TEXT"))?;
            }
            PartitionType::Lfs0 => {
                addr = overrides.lfs_addr.unwrap_or(addr);
                size = overrides.lfs_size.unwrap_or(size);
                size = align_partition(size)
                    .ok_or_else(|| layout_error(index, "LFS size overflows"))?;
                if addr == 0 {
                    addr = last_end;
                }
            }
            PartitionType::Spiffs0 => {
                addr = overrides.spiffs_addr.unwrap_or(addr);
                match overrides.spiffs_size.unwrap_or_else(|| SpiffsSize::from_raw(size)) {
                    SpiffsSize::UseAll => {
                        addr = addr.max(last_end);
                        size = flash_size
                            .checked_sub(addr)
                            .ok_or_else(|| layout_error(index, "SPIFFS starts past end of flash"))?;
                    }
                    SpiffsSize::Bytes(requested) => {
                        size = requested;
                        if addr == 0 {
                            addr = if size <= flash_size.saturating_sub(SPIFFS_BOUNDARY) {
                                SPIFFS_BOUNDARY
                            } else {
                                last_end
                            };
                        } else if addr < last_end {
                            addr = last_end;
                        }
                        if let Some(room) = flash_size.checked_sub(addr) {
                            size = size.min(room);
                        }
                    }
                }
            }
            PartitionType::SystemParameter if addr == 0 => {
                addr = flash_size
                    .checked_sub(size)
                    .ok_or_else(|| layout_error(index, "SYSTEM_PARAMETER larger than flash"))?;
            }
            _ => {}
        }

        if size == 0 {
            continue;
        }
        log::info!("  {:<18} {:06x} {:06x}", kind, addr, size);

        let reason = if addr % FLASH_PAGE_SIZE != 0 {
            Some("address not page aligned")
        } else if size % FLASH_PAGE_SIZE != 0 {
            Some("size not page aligned")
        } else if addr < last_end {
            Some("overlaps previous partition")
        } else if addr as u64 + size as u64 > flash_size as u64 {
            Some("extends past end of flash")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(layout_error(
                index,
                format!("{} {:#x}+{:#x}: {}", kind, addr, size, reason),
            ));
        }

        placed.push(Partition { kind, addr, size });
        last_end = addr + size;
    }

    Ok(PartitionTable {
        entries: placed,
        image_end: None,
    })
}

/// Re-lays out the partition table held in a record page.
///
/// Returns the resolved table, and the new page only when it differs from
/// `page`, so an unchanged table costs no erase/write cycle.
pub fn resize_page(
    page: &[u8],
    overrides: &LayoutOverrides,
    flash_size: u32,
) -> Result<(PartitionTable, Option<Vec<u8>>)> {
    let mut records = RecordPage::decode(page)?;
    let table = layout(&records.partition_table()?, overrides, flash_size)?;
    records.set_partition_table(&table)?;
    let new_page = records.encode()?;

    let changed = new_page.as_slice() != page;
    Ok((table, if changed { Some(new_page) } else { None }))
}
