use crate::chip::Chip;
use crate::connection::{Connection, Response, DEFAULT_TIMEOUT};
use crate::image::FirmwareImage;
use crate::transport::Port;
use crate::{DownloadStage, Error, Result, RomError};
use byteorder::{ByteOrder, LittleEndian};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

pub const RAM_BLOCK_SIZE: u32 = 0x1800;
pub const FLASH_BLOCK_SIZE: u32 = 0x100;
/// Bytes per frame sent back by the flash read stub.
pub const READ_CHUNK_SIZE: u32 = 0x400;

const FLASH_FILLER: u8 = 0xFF;
const ERASE_TIMEOUT: Duration = Duration::from_secs(10);
const SYNC_TIMEOUT: Duration = Duration::from_millis(500);
/// The ROM answers a single SYNC with up to eight responses.
const SYNC_EXTRA_RESPONSES: usize = 7;

fn get_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {wide_bar} {bytes}/{total_bytes} {bytes_per_sec} {eta}  ")
            .progress_chars("#>-"),
    );
    bar
}

fn rate(len: usize, elapsed: Duration) -> HumanBytes {
    HumanBytes((len as f64 / elapsed.as_secs_f64().max(0.001)) as u64)
}

fn blocks(size: u32, block_size: u32) -> u32 {
    size / block_size + (size % block_size != 0) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    RamDownload,
    FlashDownload,
    /// The ROM loader no longer listens, the chip has to be reset and synced.
    Detached,
}

/// Bounded retries for bringing up a connection.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Times the port is opened and the chip reset.
    pub attempts: u32,
    /// SYNC commands tried after every reset.
    pub syncs: u32,
    pub delay: Duration,
    /// Delay before retry `n` (1 based) given the base delay.
    pub backoff: fn(Duration, u32) -> Duration,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, _retry: u32) -> Duration {
        delay
    }

    pub fn linear(delay: Duration, retry: u32) -> Duration {
        delay * retry
    }

    fn delay_for(&self, retry: u32) -> Duration {
        (self.backoff)(self.delay, retry)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 2,
            syncs: 10,
            delay: Duration::from_millis(100),
            backoff: RetryPolicy::fixed,
        }
    }
}

fn check(stage: DownloadStage, resp: Response) -> Result<()> {
    match resp.status() {
        RomError::Success => Ok(()),
        error => Err(Error::Download { stage, error }),
    }
}

/// A session with the ESP8266 ROM serial loader.
pub struct Flasher {
    connection: Connection,
    chip: Box<dyn Chip>,
    policy: RetryPolicy,
    state: SessionState,
}

impl Flasher {
    /// Opens the port, resets the chip into the loader and syncs with it.
    ///
    /// `open` is called again for every attempt of `policy`.
    pub fn connect<F>(chip: impl Chip + 'static, mut open: F, policy: RetryPolicy) -> Result<Self>
    where
        F: FnMut() -> Result<Box<dyn Port>>,
    {
        for attempt in 1..=policy.attempts {
            let mut connection = Connection::new(open()?);
            connection.set_timeout(DEFAULT_TIMEOUT)?;
            match Self::start_connection(&mut connection, &policy) {
                Ok(()) => {
                    return Ok(Flasher {
                        connection,
                        chip: Box::new(chip),
                        policy,
                        state: SessionState::Ready,
                    })
                }
                Err(e) => {
                    log::debug!("Attempt {} failed: {}", attempt, e);
                    if attempt < policy.attempts {
                        connection.sleep(policy.delay_for(attempt));
                    }
                }
            }
        }
        Err(Error::ConnectionFailed)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Resets and syncs again on the open port, after the chip was detached.
    pub fn resync(&mut self) -> Result<()> {
        Self::start_connection(&mut self.connection, &self.policy)?;
        self.state = SessionState::Ready;
        Ok(())
    }

    fn start_connection(connection: &mut Connection, policy: &RetryPolicy) -> Result<()> {
        log::info!("Start connection...");
        connection.reset_to_flash()?;
        connection.with_timeout(SYNC_TIMEOUT, |connection| {
            for i in 1..=policy.syncs {
                match Self::sync(connection) {
                    Ok(()) => {
                        log::info!("Connection Succeed");
                        return Ok(());
                    }
                    Err(e) => {
                        log::debug!("Retry {}: {}", i, e);
                        connection.sleep(policy.delay_for(i));
                    }
                }
            }
            Err(Error::ConnectionFailed)
        })
    }

    fn sync(connection: &mut Connection) -> Result<()> {
        connection.command(protocol::Sync::default())?;
        for _ in 0..SYNC_EXTRA_RESPONSES {
            if connection.read_response(None).is_err() {
                break;
            }
        }
        Ok(())
    }

    fn check_attached(&self, op: &'static str) -> Result<()> {
        match self.state {
            SessionState::Detached => Err(Error::InvalidState {
                op,
                state: self.state,
            }),
            _ => Ok(()),
        }
    }

    fn check_state(&self, op: &'static str, expected: SessionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    pub fn read_reg(&mut self, addr: u32) -> Result<u32> {
        self.check_attached("read_reg")?;
        let resp = self.connection.command(protocol::ReadReg { addr })?;
        match resp.status() {
            RomError::Success => Ok(resp.value),
            error => Err(Error::RegisterAccess { addr, error }),
        }
    }

    pub fn write_reg(&mut self, addr: u32, value: u32, mask: u32, delay_us: u32) -> Result<()> {
        self.check_attached("write_reg")?;
        let resp = self.connection.command(protocol::WriteReg {
            addr,
            value,
            mask,
            delay_us,
        })?;
        match resp.status() {
            RomError::Success => Ok(()),
            error => Err(Error::RegisterAccess { addr, error }),
        }
    }

    pub fn mem_begin(&mut self, size: u32, blocks: u32, block_size: u32, offset: u32) -> Result<()> {
        self.check_attached("mem_begin")?;
        let resp = self.connection.command(protocol::MemBegin {
            size,
            blocks,
            block_size,
            offset,
        })?;
        check(DownloadStage::MemBegin, resp)?;
        self.state = SessionState::RamDownload;
        Ok(())
    }

    pub fn mem_block(&mut self, data: &[u8], seq: u32) -> Result<()> {
        self.check_state("mem_block", SessionState::RamDownload)?;
        let resp = self.connection.command(protocol::MemData::new(data, seq))?;
        check(DownloadStage::MemBlock, resp)
    }

    /// Leaves RAM download. A zero `entry` keeps the loader running, anything
    /// else jumps there and detaches the session.
    pub fn mem_finish(&mut self, entry: u32) -> Result<()> {
        self.check_state("mem_finish", SessionState::RamDownload)?;
        let resp = self.connection.command(protocol::MemEnd {
            no_entry: (entry == 0) as u32,
            entry,
        })?;
        check(DownloadStage::MemFinish, resp)?;
        self.state = if entry == 0 {
            SessionState::Ready
        } else {
            SessionState::Detached
        };
        Ok(())
    }

    /// Starts a flash download of `size` bytes at `offset`, erasing the
    /// region first.
    pub fn flash_begin(&mut self, size: u32, offset: u32) -> Result<()> {
        self.check_attached("flash_begin")?;
        let blocks = blocks(size, FLASH_BLOCK_SIZE);
        let resp = self.connection.with_timeout(ERASE_TIMEOUT, |connection| {
            connection.command(protocol::FlashBegin {
                size,
                blocks,
                block_size: FLASH_BLOCK_SIZE,
                offset,
            })
        })?;
        check(DownloadStage::FlashBegin, resp)?;
        self.state = SessionState::FlashDownload;
        Ok(())
    }

    /// Writes one block, padding a short one with 0xFF.
    pub fn flash_block(&mut self, data: &[u8], seq: u32) -> Result<()> {
        self.check_state("flash_block", SessionState::FlashDownload)?;
        let mut block = data.to_vec();
        if block.len() < FLASH_BLOCK_SIZE as usize {
            block.resize(FLASH_BLOCK_SIZE as usize, FLASH_FILLER);
        }
        let resp = self
            .connection
            .command(protocol::FlashData::new(&block, seq))?;
        check(DownloadStage::FlashBlock, resp)
    }

    pub fn flash_finish(&mut self, reboot: bool) -> Result<()> {
        self.check_state("flash_finish", SessionState::FlashDownload)?;
        let resp = self.connection.command(protocol::FlashEnd {
            stay_in_loader: (!reboot) as u32,
        })?;
        check(DownloadStage::FlashFinish, resp)?;
        self.state = if reboot {
            SessionState::Detached
        } else {
            SessionState::Ready
        };
        Ok(())
    }

    /// Runs the application in flash.
    pub fn run(&mut self, reboot: bool) -> Result<()> {
        self.flash_begin(0, 0)?;
        self.flash_finish(reboot)
    }

    /// Downloads every segment of `image` to RAM and jumps to its entrypoint.
    pub fn load_ram(&mut self, image: &FirmwareImage) -> Result<()> {
        for segment in &image.segments {
            let size = segment.data.len() as u32;
            log::info!("Downloading {} bytes at {:08x}...", size, segment.addr);
            self.mem_begin(
                size,
                blocks(size, RAM_BLOCK_SIZE),
                RAM_BLOCK_SIZE,
                segment.addr,
            )?;
            for (seq, block) in segment.data.chunks(RAM_BLOCK_SIZE as usize).enumerate() {
                self.mem_block(block, seq as u32)?;
            }
        }
        log::info!("All segments done, executing at {:08x}", image.entry);
        self.mem_finish(image.entry)
    }

    /// Writes `data` to flash at `addr`. The session stays in flash download
    /// so several blobs can be written before `flash_finish`.
    pub fn write_flash(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let count = blocks(data.len() as u32, FLASH_BLOCK_SIZE);
        log::info!("Erasing flash at {:#x}...", addr);
        self.flash_begin(count * FLASH_BLOCK_SIZE, addr)?;

        let start = Instant::now();
        log::info!(
            "Program flash... {:x}",
            Sha256::digest(data)
        );
        let pb = get_bar(data.len() as u64);
        for (seq, block) in data.chunks(FLASH_BLOCK_SIZE as usize).enumerate() {
            self.flash_block(block, seq as u32)?;
            pb.inc(block.len() as u64);
        }
        pb.finish_and_clear();
        let elapsed = start.elapsed();
        log::info!(
            "Wrote {} bytes at {:#x} in {:?} {}/s",
            data.len(),
            addr,
            elapsed,
            rate(data.len(), elapsed)
        );
        Ok(())
    }

    /// Reads `size` bytes of flash at `offset` through the read stub.
    ///
    /// The stub bypasses the command envelope: it answers with raw frames of
    /// flash contents and never returns to the loader, so the session is
    /// detached afterwards and needs a [`Flasher::resync`].
    pub fn read_flash(&mut self, offset: u32, size: u32) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let stub = self.chip.flash_read_stub();
        let count = blocks(size, READ_CHUNK_SIZE);
        let mut code = stub.code.to_vec();
        LittleEndian::write_u32_into(&[offset, READ_CHUNK_SIZE, count], &mut code[..12]);

        // the stub needs the flash subsystem initialised
        self.flash_begin(0, 0)?;
        let len = code.len() as u32;
        self.mem_begin(len, 1, len, stub.load_addr)?;
        self.mem_block(&code, 0)?;
        self.mem_finish(stub.entry)?;

        let pb = get_bar(size as u64);
        let mut data = Vec::with_capacity((count * READ_CHUNK_SIZE) as usize);
        for _ in 0..count {
            let chunk = self.connection.read_frame()?;
            if chunk.len() != READ_CHUNK_SIZE as usize {
                pb.finish_and_clear();
                return Err(Error::InvalidFrame {
                    expected: READ_CHUNK_SIZE as usize,
                    actual: chunk.len(),
                });
            }
            data.extend_from_slice(&chunk);
            pb.inc(chunk.len() as u64);
        }
        pb.finish_and_clear();
        data.truncate(size as usize);

        log::info!(
            "Read {} bytes at {:#x}, sha256 {}",
            size,
            offset,
            hex::encode(Sha256::digest(&data))
        );
        Ok(data)
    }

    /// Jumps into the ROM chip erase routine.
    ///
    /// Completion can not be observed, the session is detached afterwards and
    /// the chip will not boot until it is flashed again.
    pub fn erase_chip(&mut self) -> Result<()> {
        log::info!("Erasing flash (this may take a while)...");
        self.flash_begin(0, 0)?;
        self.mem_begin(0, 0, 0, self.chip.chip_erase_load_addr())?;
        self.mem_finish(self.chip.chip_erase_entry())?;
        self.state = SessionState::Detached;
        Ok(())
    }

    /// Reads `size` bytes of memory one register at a time.
    pub fn dump_mem(&mut self, addr: u32, size: u32) -> Result<Vec<u8>> {
        let pb = get_bar(size as u64);
        let mut data = vec![0u8; (size / 4 * 4) as usize];
        for (i, word) in data.chunks_exact_mut(4).enumerate() {
            let value = self.read_reg(addr + i as u32 * 4)?;
            LittleEndian::write_u32(word, value);
            pb.inc(4);
        }
        pb.finish_and_clear();
        Ok(data)
    }

    pub fn read_mac(&mut self) -> Result<[u8; 6]> {
        let [mac0, mac1] = self.chip.mac_registers();
        let words = [self.read_reg(mac0)?, self.read_reg(mac1)?];
        Ok(self.chip.mac_address(words))
    }
}

mod protocol {
    use crate::connection::Command;
    use deku::prelude::*;

    pub const FLASH_BEGIN: u8 = 0x02;
    pub const FLASH_DATA: u8 = 0x03;
    pub const FLASH_END: u8 = 0x04;
    pub const MEM_BEGIN: u8 = 0x05;
    pub const MEM_END: u8 = 0x06;
    pub const MEM_DATA: u8 = 0x07;
    pub const SYNC: u8 = 0x08;
    pub const WRITE_REG: u8 = 0x09;
    pub const READ_REG: u8 = 0x0a;

    #[derive(Debug, DekuWrite)]
    #[deku(endian = "little")]
    pub struct FlashBegin {
        pub size: u32,
        pub blocks: u32,
        pub block_size: u32,
        pub offset: u32,
    }
    impl_command!(FLASH_BEGIN, FlashBegin);

    #[derive(Debug, DekuWrite)]
    #[deku(endian = "little")]
    pub struct FlashData {
        pub len: u32,
        pub seq: u32,
        pub reserved: [u32; 2],
        pub data: Vec<u8>,
    }
    impl_command!(FLASH_DATA, FlashData, checksum);

    impl FlashData {
        pub fn new(data: &[u8], seq: u32) -> Self {
            FlashData {
                len: data.len() as u32,
                seq,
                reserved: [0; 2],
                data: data.to_vec(),
            }
        }
    }

    #[derive(Debug, DekuWrite)]
    #[deku(endian = "little")]
    pub struct FlashEnd {
        pub stay_in_loader: u32,
    }
    impl_command!(FLASH_END, FlashEnd);

    #[derive(Debug, DekuWrite)]
    #[deku(endian = "little")]
    pub struct MemBegin {
        pub size: u32,
        pub blocks: u32,
        pub block_size: u32,
        pub offset: u32,
    }
    impl_command!(MEM_BEGIN, MemBegin);

    #[derive(Debug, DekuWrite)]
    #[deku(endian = "little")]
    pub struct MemData {
        pub len: u32,
        pub seq: u32,
        pub reserved: [u32; 2],
        pub data: Vec<u8>,
    }
    impl_command!(MEM_DATA, MemData, checksum);

    impl MemData {
        pub fn new(data: &[u8], seq: u32) -> Self {
            MemData {
                len: data.len() as u32,
                seq,
                reserved: [0; 2],
                data: data.to_vec(),
            }
        }
    }

    #[derive(Debug, DekuWrite)]
    #[deku(endian = "little")]
    pub struct MemEnd {
        pub no_entry: u32,
        pub entry: u32,
    }
    impl_command!(MEM_END, MemEnd);

    #[derive(Debug, DekuWrite)]
    pub struct Sync {
        pub payload: Vec<u8>,
    }
    impl_command!(SYNC, Sync);

    impl Default for Sync {
        fn default() -> Self {
            let mut payload = vec![0x07, 0x07, 0x12, 0x20];
            payload.extend_from_slice(&[0x55; 32]);
            Sync { payload }
        }
    }

    #[derive(Debug, DekuWrite)]
    #[deku(endian = "little")]
    pub struct WriteReg {
        pub addr: u32,
        pub value: u32,
        pub mask: u32,
        pub delay_us: u32,
    }
    impl_command!(WRITE_REG, WriteReg);

    #[derive(Debug, DekuWrite)]
    #[deku(endian = "little")]
    pub struct ReadReg {
        pub addr: u32,
    }
    impl_command!(READ_REG, ReadReg);
}
