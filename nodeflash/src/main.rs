use env_logger::Env;
use main_error::MainError;
use nodeflash::{
    chip::Esp8266,
    elf::{self, ElfImage},
    image::{
        self,
        partition::{DEFAULT_FLASH_SIZE, FLASH_PAGE_SIZE, PARTITION_PAGE_OFFSET},
        FirmwareImage, FlashFreq, FlashMode, FlashSize, LayoutOverrides, PartitionType,
        SpiffsSize,
    },
    lfs,
    transport::{Port, SerialTransport},
    Config, Flasher, RetryPolicy, SessionState, DEFAULT_BAUDRATE,
};
use std::fs::{read, write};
use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;

/// Parses a byte count, accepting `0x` hex and `K`/`M` suffixes.
fn parse_size(s: &str) -> Result<u32, String> {
    let (digits, scale) = if let Some(n) = s.strip_suffix(|c: char| c == 'M' || c == 'm') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix(|c: char| c == 'K' || c == 'k') {
        (n, 1024)
    } else {
        (s, 1)
    };
    let n: u32 = parse_int::parse(digits).map_err(|e| format!("{}: {}", s, e))?;
    n.checked_mul(scale)
        .ok_or_else(|| format!("{} does not fit in 32 bits", s))
}

/// `-1` or `all` asks for all flash after the previous partition.
fn parse_spiffs_size(s: &str) -> Result<SpiffsSize, String> {
    match s {
        "-1" | "all" => Ok(SpiffsSize::UseAll),
        _ => parse_size(s).map(SpiffsSize::Bytes),
    }
}

#[derive(StructOpt)]
struct Connection {
    /// Serial port, defaults to connection.serial of the config file
    #[structopt(short, long)]
    port: Option<String>,
    /// Baud rate, defaults to connection.baud of the config file or 115200
    #[structopt(short, long)]
    baud: Option<usize>,
}

impl Connection {
    fn create_flasher(&self, config: &Config) -> Result<Flasher, MainError> {
        let port = self
            .port
            .clone()
            .or_else(|| config.connection.serial.clone())
            .ok_or("no serial port given, use --port or set connection.serial in the config file")?;
        let baud = self
            .baud
            .or(config.connection.baud)
            .unwrap_or(DEFAULT_BAUDRATE);

        let flasher = Flasher::connect(
            Esp8266,
            || Ok(Box::new(SerialTransport::open(&port, baud)?) as Box<dyn Port>),
            RetryPolicy::default(),
        )?;
        Ok(flasher)
    }
}

#[derive(StructOpt)]
struct ImageOpt {
    #[structopt(flatten)]
    conn: Connection,
    /// Firmware image file
    #[structopt(parse(from_os_str))]
    image: PathBuf,
}

#[derive(StructOpt)]
struct ReadMemOpt {
    #[structopt(flatten)]
    conn: Connection,
    #[structopt(parse(try_from_str = parse_int::parse))]
    address: u32,
}

#[derive(StructOpt)]
struct WriteMemOpt {
    #[structopt(flatten)]
    conn: Connection,
    #[structopt(parse(try_from_str = parse_int::parse))]
    address: u32,
    #[structopt(parse(try_from_str = parse_int::parse))]
    value: u32,
    #[structopt(parse(try_from_str = parse_int::parse), default_value = "0xffffffff")]
    mask: u32,
}

#[derive(StructOpt)]
struct DumpOpt {
    #[structopt(flatten)]
    conn: Connection,
    /// Start address
    #[structopt(parse(try_from_str = parse_int::parse))]
    address: u32,
    /// Number of bytes
    #[structopt(parse(try_from_str = parse_size))]
    size: u32,
    /// Output file
    #[structopt(parse(from_os_str))]
    output: PathBuf,
}

#[derive(StructOpt)]
struct WriteFlashOpt {
    #[structopt(flatten)]
    conn: Connection,
    /// Address and binary file pairs
    #[structopt(required = true)]
    addr_file: Vec<String>,
}

#[derive(StructOpt)]
struct ConnOpt {
    #[structopt(flatten)]
    conn: Connection,
}

#[derive(StructOpt)]
struct ImageInfoOpt {
    #[structopt(parse(from_os_str))]
    image: PathBuf,
}

#[derive(StructOpt)]
struct MakeImageOpt {
    /// Output image file
    #[structopt(parse(from_os_str))]
    output: PathBuf,
    /// Segment data file
    #[structopt(short = "f", long = "segfile", parse(from_os_str))]
    segfile: Vec<PathBuf>,
    /// Segment load address
    #[structopt(short = "a", long = "segaddr", parse(try_from_str = parse_int::parse))]
    segaddr: Vec<u32>,
    /// Entrypoint address
    #[structopt(short = "e", long = "entrypoint", parse(try_from_str = parse_int::parse), default_value = "0")]
    entrypoint: u32,
}

enum ImageFormat {
    /// Bootable image and flash mapped code in one file
    Combined,
    /// One file per flash offset
    Split,
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "combined" => Ok(ImageFormat::Combined),
            "split" => Ok(ImageFormat::Split),
            _ => Err(format!("unknown image format {}", s)),
        }
    }
}

#[derive(StructOpt)]
struct Elf2ImageOpt {
    /// Linked firmware
    #[structopt(parse(from_os_str))]
    input: PathBuf,
    /// Output file prefix, defaults to the input name followed by '-'
    #[structopt(short, long)]
    output: Option<String>,
    /// `split` or `combined`
    #[structopt(long, default_value = "combined")]
    format: ImageFormat,
    #[structopt(long, default_value = "qio")]
    flash_mode: FlashMode,
    #[structopt(long, default_value = "4m")]
    flash_size: FlashSize,
    #[structopt(long, default_value = "40m")]
    flash_freq: FlashFreq,
}

#[derive(StructOpt)]
struct PartitionOpt {
    #[structopt(flatten)]
    conn: Connection,
    /// Flash size used to place partitions, defaults to flash.size of the
    /// config file or 4M
    #[structopt(long, parse(try_from_str = parse_size))]
    flash_size: Option<u32>,
    /// Start address of the LFS partition
    #[structopt(long, parse(try_from_str = parse_size))]
    lfs_addr: Option<u32>,
    /// Size of the LFS partition
    #[structopt(long, parse(try_from_str = parse_size))]
    lfs_size: Option<u32>,
    /// Gzip compressed LFS image to relocate and write
    #[structopt(long, parse(from_os_str))]
    lfs_file: Option<PathBuf>,
    /// Start address of the SPIFFS partition
    #[structopt(long, parse(try_from_str = parse_size))]
    spiffs_addr: Option<u32>,
    /// Size of the SPIFFS partition, `all` or -1 for the rest of the flash
    #[structopt(long, parse(try_from_str = parse_spiffs_size), allow_hyphen_values = true)]
    spiffs_size: Option<SpiffsSize>,
    /// SPIFFS image to write
    #[structopt(long, parse(from_os_str))]
    spiffs_file: Option<PathBuf>,
}

#[derive(StructOpt)]
enum Opt {
    /// Download an image to RAM and execute it
    LoadRam(ImageOpt),
    /// Read an arbitrary memory location
    ReadMem(ReadMemOpt),
    /// Write to an arbitrary memory location
    WriteMem(WriteMemOpt),
    /// Dump arbitrary memory to a file
    DumpMem(DumpOpt),
    /// Write binaries to flash
    WriteFlash(WriteFlashOpt),
    /// Read flash contents to a file
    ReadFlash(DumpOpt),
    /// Erase the whole flash chip
    EraseFlash(ConnOpt),
    /// Run the application in flash
    Run(ConnOpt),
    /// Read the MAC address from OTP
    ReadMac(ConnOpt),
    /// Dump the headers of a firmware image
    ImageInfo(ImageInfoOpt),
    /// Build a firmware image from binary segments
    MakeImage(MakeImageOpt),
    /// Build flashable images from a linked firmware
    Elf2image(Elf2ImageOpt),
    /// Lay out partitions and write LFS and SPIFFS images
    Partition(PartitionOpt),
}

fn load_ram(opt: ImageOpt, config: &Config) -> Result<(), MainError> {
    let image = FirmwareImage::decode(&read(&opt.image)?)?;
    let mut flasher = opt.conn.create_flasher(config)?;
    log::info!("RAM boot...");
    flasher.load_ram(&image)?;
    Ok(())
}

fn read_mem(opt: ReadMemOpt, config: &Config) -> Result<(), MainError> {
    let mut flasher = opt.conn.create_flasher(config)?;
    let value = flasher.read_reg(opt.address)?;
    println!("0x{:08x} = 0x{:08x}", opt.address, value);
    Ok(())
}

fn write_mem(opt: WriteMemOpt, config: &Config) -> Result<(), MainError> {
    let mut flasher = opt.conn.create_flasher(config)?;
    flasher.write_reg(opt.address, opt.value, opt.mask, 0)?;
    println!(
        "Wrote {:08x}, mask {:08x} to {:08x}",
        opt.value, opt.mask, opt.address
    );
    Ok(())
}

fn dump_mem(opt: DumpOpt, config: &Config) -> Result<(), MainError> {
    let mut flasher = opt.conn.create_flasher(config)?;
    let data = flasher.dump_mem(opt.address, opt.size)?;
    write(&opt.output, data)?;
    log::info!("Success");
    Ok(())
}

fn write_flash(opt: WriteFlashOpt, config: &Config) -> Result<(), MainError> {
    if opt.addr_file.len() % 2 != 0 {
        return Err("expected address and file pairs".into());
    }
    let mut blobs = Vec::new();
    for pair in opt.addr_file.chunks(2) {
        let addr: u32 = parse_int::parse(&pair[0]).map_err(|e| format!("{}: {}", pair[0], e))?;
        blobs.push((addr, read(&pair[1])?));
    }

    let mut flasher = opt.conn.create_flasher(config)?;
    for (addr, data) in &blobs {
        flasher.write_flash(*addr, data)?;
    }
    log::info!("Leaving...");
    flasher.flash_finish(false)?;
    Ok(())
}

fn read_flash(opt: DumpOpt, config: &Config) -> Result<(), MainError> {
    let mut flasher = opt.conn.create_flasher(config)?;
    let data = flasher.read_flash(opt.address, opt.size)?;
    write(&opt.output, data)?;
    log::info!("Success");
    Ok(())
}

fn erase_flash(opt: ConnOpt, config: &Config) -> Result<(), MainError> {
    let mut flasher = opt.conn.create_flasher(config)?;
    flasher.erase_chip()?;
    log::info!("Erase started, the chip will not answer until it is done");
    Ok(())
}

fn run(opt: ConnOpt, config: &Config) -> Result<(), MainError> {
    let mut flasher = opt.conn.create_flasher(config)?;
    flasher.run(false)?;
    Ok(())
}

fn read_mac(opt: ConnOpt, config: &Config) -> Result<(), MainError> {
    let mut flasher = opt.conn.create_flasher(config)?;
    let mac = flasher.read_mac()?;
    let mac: Vec<String> = mac.iter().map(|b| format!("{:02x}", b)).collect();
    println!("MAC: {}", mac.join(":"));
    Ok(())
}

fn image_info(opt: ImageInfoOpt) -> Result<(), MainError> {
    let (image, stored) = FirmwareImage::decode_with_checksum(&read(&opt.image)?)?;
    if image.entry != 0 {
        println!("Entry point: {:08x}", image.entry);
    } else {
        println!("Entry point not set");
    }
    println!("{} segments", image.segments.len());
    println!();
    for (i, segment) in image.segments.iter().enumerate() {
        println!(
            "Segment {}: {:5} bytes at {:08x}",
            i + 1,
            segment.data.len(),
            segment.addr
        );
    }
    println!();
    let valid = if image.checksum() == stored {
        "valid"
    } else {
        "invalid!"
    };
    println!("Checksum: {:02x} ({})", stored, valid);
    Ok(())
}

fn make_image(opt: MakeImageOpt) -> Result<(), MainError> {
    if opt.segfile.is_empty() {
        return Err("no segments specified".into());
    }
    if opt.segfile.len() != opt.segaddr.len() {
        return Err("number of segment files does not match number of addresses".into());
    }
    let mut image = FirmwareImage::new(opt.entrypoint);
    for (file, addr) in opt.segfile.iter().zip(&opt.segaddr) {
        image.add_segment(*addr, read(file)?);
    }
    write(&opt.output, image.encode()?)?;
    Ok(())
}

fn elf2image(opt: Elf2ImageOpt) -> Result<(), MainError> {
    let data = read(&opt.input)?;
    let elf = ElfImage::from_data(&data)?;
    let (mut image, irom) = elf::elf2image(&elf)?;
    image.set_flash_params(opt.flash_mode, opt.flash_size, opt.flash_freq);
    let bytes = image.encode()?;

    let prefix = match opt.output {
        Some(prefix) => prefix,
        None => format!("{}-", opt.input.display()),
    };
    match opt.format {
        ImageFormat::Combined => {
            write(format!("{}0x00000.bin", prefix), elf::combine(&bytes, &irom)?)?;
        }
        ImageFormat::Split => {
            write(format!("{}0x00000.bin", prefix), bytes)?;
            write(format!("{}0x{:05x}.bin", prefix, irom.addr), &irom.data)?;
        }
    }
    log::info!("Entry {:08x}, flash mapped code at {:#x}", image.entry, irom.addr);
    Ok(())
}

fn partition(opt: PartitionOpt, config: &Config) -> Result<(), MainError> {
    let flash_size = match (opt.flash_size, &config.flash.size) {
        (Some(size), _) => size,
        (None, Some(size)) => parse_size(size)?,
        (None, None) => DEFAULT_FLASH_SIZE,
    };
    let lfs_image = opt.lfs_file.as_ref().map(read).transpose()?;
    let spiffs_image = opt.spiffs_file.as_ref().map(read).transpose()?;
    let overrides = LayoutOverrides {
        lfs_addr: opt.lfs_addr,
        lfs_size: opt.lfs_size,
        spiffs_addr: opt.spiffs_addr,
        spiffs_size: opt.spiffs_size,
    };

    let mut flasher = opt.conn.create_flasher(config)?;
    log::info!("Reading partition table...");
    let page = flasher.read_flash(PARTITION_PAGE_OFFSET, FLASH_PAGE_SIZE)?;
    flasher.resync()?;

    let (table, new_page) = image::resize_page(&page, &overrides, flash_size)?;
    if let Some(new_page) = new_page {
        log::info!("Partition table updated");
        flasher.write_flash(PARTITION_PAGE_OFFSET, &new_page)?;
    }

    if let Some(compressed) = lfs_image {
        let lfs = table
            .find(PartitionType::Lfs0)
            .ok_or("no LFS partition, cannot write LFS image")?;
        let data = lfs::decompress(&compressed, lfs.size)?;
        let data = lfs::relocate(&data, lfs.addr, lfs.size)?;
        log::info!("Writing LFS image to {:#x}", lfs.addr);
        flasher.write_flash(lfs.addr, &data)?;
    }

    if let Some(data) = spiffs_image {
        let spiffs = table
            .find(PartitionType::Spiffs0)
            .ok_or("no SPIFFS partition, cannot write SPIFFS image")?;
        if data.len() > spiffs.size as usize {
            return Err("SPIFFS partition too small for SPIFFS image".into());
        }
        log::info!("Writing SPIFFS image to {:#x}", spiffs.addr);
        flasher.write_flash(spiffs.addr, &data)?;
    }

    if flasher.state() == SessionState::FlashDownload {
        flasher.flash_finish(false)?;
    }
    log::info!("Success");
    Ok(())
}

#[paw::main]
fn main(args: Opt) -> Result<(), MainError> {
    env_logger::Builder::from_env(Env::default().default_filter_or("nodeflash=info"))
        .format_timestamp(None)
        .init();
    let config = Config::load();

    match args {
        Opt::LoadRam(opt) => load_ram(opt, &config)?,
        Opt::ReadMem(opt) => read_mem(opt, &config)?,
        Opt::WriteMem(opt) => write_mem(opt, &config)?,
        Opt::DumpMem(opt) => dump_mem(opt, &config)?,
        Opt::WriteFlash(opt) => write_flash(opt, &config)?,
        Opt::ReadFlash(opt) => read_flash(opt, &config)?,
        Opt::EraseFlash(opt) => erase_flash(opt, &config)?,
        Opt::Run(opt) => run(opt, &config)?,
        Opt::ReadMac(opt) => read_mac(opt, &config)?,
        Opt::ImageInfo(opt) => image_info(opt)?,
        Opt::MakeImage(opt) => make_image(opt)?,
        Opt::Elf2image(opt) => elf2image(opt)?,
        Opt::Partition(opt) => partition(opt, &config)?,
    };

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_with_suffixes() {
        assert_eq!(parse_size("4M"), Ok(0x40_0000));
        assert_eq!(parse_size("512k"), Ok(0x8_0000));
        assert_eq!(parse_size("0x10000"), Ok(0x10000));
        assert_eq!(parse_size("4096"), Ok(4096));
        assert!(parse_size("8192M").is_err());
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn spiffs_use_all_spellings() {
        assert_eq!(parse_spiffs_size("-1"), Ok(SpiffsSize::UseAll));
        assert_eq!(parse_spiffs_size("all"), Ok(SpiffsSize::UseAll));
        assert_eq!(parse_spiffs_size("64K"), Ok(SpiffsSize::Bytes(0x10000)));
    }
}
