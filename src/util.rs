use log::info;

use structopt::StructOpt;

pub use linux_embedded_hal::sysfs_gpio::{Direction, Error as PinError};
pub use linux_embedded_hal::{spidev, spidev::SpiModeFlags, Pin as Pindev, Spidev};

use simplelog::{LevelFilter, TermLogger, TerminalMode};

use ihex::{Reader, Record};

use dataflash_memory::{prelude::*, Config, DataFlash, EraseGranularity, PageSizeMode};

type Flash = DataFlash<Spidev, Pindev, Pindev>;
type BoxError = Box<dyn std::error::Error + 'static>;

#[derive(Debug, PartialEq, StructOpt)]
struct Options {
    #[structopt(subcommand)]
    operation: Operations,

    /// SPI device
    #[structopt(long, default_value = "/dev/spidev0.0", env = "SPI_DEV")]
    spi_dev: String,

    /// SPI baud rate
    #[structopt(long, default_value = "40000000", env = "SPI_BAUD")]
    spi_baud: u32,

    /// Chip Select (output) pin
    #[structopt(long, default_value = "8", env = "CS_PIN")]
    cs_pin: u64,

    /// Write Protect (output) pin, if wired
    #[structopt(long, env = "WP_PIN")]
    wp_pin: Option<u64>,

    /// Page size mode (as-configured, binary, dataflash)
    #[structopt(long, default_value = "as-configured", parse(try_from_str = parse_page_size))]
    page_size: PageSizeMode,

    /// Erase single pages instead of 8-page blocks
    #[structopt(long)]
    page_erase: bool,

    /// Compare every programmed page against the written data
    #[structopt(long)]
    verify: bool,

    /// Give up after this many busy status reads
    #[structopt(long)]
    poll_limit: Option<u32>,

    /// Configure log level
    #[structopt(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: LevelFilter,
}

#[derive(Debug, PartialEq, StructOpt)]
pub enum Operations {
    /// Read device information
    Info,
    /// Read data from the device
    Read {
        /// Flash address for read start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,
        /// Length of flash read in bytes
        #[structopt()]
        length: u32,
    },
    /// Write data at an arbitrary address, preserving the rest of the
    /// touched pages
    Write {
        /// Flash address for write start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,

        // Data to write in hexadecimal
        #[structopt(long)]
        data: HexData,
    },
    /// Erase block(s) starting at the specified address
    EraseBlocks {
        /// Flash address for block erase in hex
        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,

        /// Number of blocks to erase
        #[structopt(long, default_value = "1")]
        count: u32,
    },
    /// Dump flash into a hex file
    Dump {
        /// Flash address for read start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,

        /// Length of flash read in bytes
        #[structopt()]
        length: u32,

        /// Output ihex file
        #[structopt(long, default_value = "dump.ihex")]
        file: String,
    },
    /// Load flash from a hex file
    Load {
        /// Input ihex file
        file: String,
    },
    /// Erase all data on the device
    EraseAll,
}

#[derive(Debug, PartialEq)]
pub struct HexData(Vec<u8>);

impl std::str::FromStr for HexData {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode(s).map(HexData)
    }
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16)
}

fn parse_page_size(s: &str) -> Result<PageSizeMode, String> {
    match s {
        "as-configured" => Ok(PageSizeMode::AsConfigured),
        "binary" => Ok(PageSizeMode::Binary),
        "dataflash" => Ok(PageSizeMode::DataFlash),
        other => Err(format!("unknown page size mode '{}'", other)),
    }
}

trait ResultExt<T, E> {
    fn dbg_err(self, msg: &str) -> Result<T, BoxError>;
}

impl<T, E: std::fmt::Debug> ResultExt<T, E> for Result<T, E> {
    fn dbg_err(self, msg: &str) -> Result<T, BoxError> {
        self.map_err(|e| format!("{}: {:?}", msg, e).into())
    }
}

fn output_pin(number: u64, initial_high: bool) -> Result<Pindev, PinError> {
    let pin = Pindev::new(number);
    pin.export()?;
    pin.set_direction(if initial_high {
        Direction::High
    } else {
        Direction::Low
    })?;
    Ok(pin)
}

/// Writes `data` at `address` by reading back the surrounding pages and
/// reprogramming them with the chip's built-in erase.
fn write_bytes(flash: &mut Flash, address: u32, data: &[u8]) -> Result<(), BoxError> {
    let page = flash.program_size();
    let start = address - address % page;
    let end = address
        .checked_add(data.len() as u32)
        .ok_or("write past the end of the address space")?;
    let end = (end + page - 1) / page * page;

    let mut buff = vec![0u8; (end - start) as usize];
    flash.read(start, &mut buff).dbg_err("read")?;
    let at = (address - start) as usize;
    buff[at..at + data.len()].copy_from_slice(data);
    flash.erase_and_program(start, &buff).dbg_err("program")?;
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), BoxError> {
    // Load options
    let opts = Options::from_args();

    // Setup logging
    TermLogger::init(
        opts.log_level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
    )
    .dbg_err("logger")?;

    // Connect and configure GPIO pins
    let cs_pin = output_pin(opts.cs_pin, true)?;
    let wp_pin = opts.wp_pin.map(|n| output_pin(n, false)).transpose()?;

    // Connect and configure SPI device
    let mut spi = Spidev::open(&opts.spi_dev)?;

    let mut spi_config = spidev::SpidevOptions::new();
    spi_config.mode(SpiModeFlags::SPI_MODE_0 | SpiModeFlags::SPI_NO_CS);
    spi_config.max_speed_hz(opts.spi_baud);
    spi.configure(&spi_config)?;

    let config = Config {
        page_size_mode: opts.page_size,
        erase_granularity: if opts.page_erase {
            EraseGranularity::Page
        } else {
            EraseGranularity::Block
        },
        busy_poll_limit: opts.poll_limit,
        verify_writes: opts.verify,
    };

    // Instantiate and probe the DataFlash
    let mut flash: Flash = DataFlash::with_config(spi, cs_pin, wp_pin, config);
    flash.init().dbg_err("initialising flash")?;

    if let (Some(id), Some(geometry)) = (flash.identification(), flash.geometry()) {
        info!(
            "Flash: {} {:?}, {} bytes, page {} bytes, erase {} bytes{}",
            geometry.part_name(),
            id,
            geometry.total_size(),
            geometry.page_size(),
            flash.erase_size(),
            if geometry.is_binary() { " (binary pages)" } else { "" }
        );
    }

    // Perform the requested operation
    match &opts.operation {
        Operations::Info => (),
        Operations::Read { address, length } => {
            info!("Reading {} bytes from address 0x{:08x}", length, address);

            let mut buff = vec![0u8; *length as usize];
            flash.read(*address, &mut buff).dbg_err("read")?;

            info!("Read: {:02x?}", buff);
        }
        Operations::Write { address, data } => {
            info!("Writing {} bytes to address 0x{:08x}", data.0.len(), address);

            write_bytes(&mut flash, *address, &data.0)?;

            info!("Write complete");
        }
        Operations::EraseBlocks { address, count } => {
            info!("Erasing {} blocks at address 0x{:08x}", count, address);

            let size = flash.erase_size() * *count;
            flash.erase(*address, size).dbg_err("erase")?;

            info!("Block erase complete")
        }
        Operations::EraseAll => {
            info!("Erasing all blocks");

            flash.erase_all().dbg_err("chip erase")?;

            info!("Full erase complete");
        }
        Operations::Dump {
            address,
            length,
            file,
        } => {
            info!(
                "Reading {} bytes from address 0x{:08x} to file {}",
                length, address, &file
            );

            let mut buff = vec![0u8; *length as usize];
            flash.read(*address, &mut buff).dbg_err("read")?;

            let mut records = Vec::new();
            let mut upper = None;
            for (c, chunk) in buff.chunks(32).enumerate() {
                let addr = *address as usize + c * 32;
                let high = (addr >> 16) as u16;
                if upper != Some(high) {
                    records.push(Record::ExtendedLinearAddress(high));
                    upper = Some(high);
                }
                records.push(Record::Data {
                    offset: addr as u16,
                    value: chunk.to_vec(),
                });
            }
            records.push(Record::EndOfFile);

            let data = ihex::create_object_file_representation(&records).dbg_err("ihex")?;

            std::fs::write(file, data)?;

            info!("Dump complete");
        }
        Operations::Load { file } => {
            info!("Loading file {}", file);

            let data = std::fs::read_to_string(&file)?;

            let reader = Reader::new(&data);
            let mut upper = 0u32;

            for record in reader {
                match record.dbg_err("ihex")? {
                    Record::Data { offset, value } => {
                        let addr = upper | u32::from(offset);
                        info!("Writing {} bytes at address 0x{:08x}", value.len(), addr);
                        write_bytes(&mut flash, addr, &value)?;
                    }
                    Record::ExtendedLinearAddress(high) => upper = u32::from(high) << 16,
                    Record::EndOfFile => (),
                    other => {
                        return Err(format!("Unrecognised record: {:?}", other).into());
                    }
                }
            }

            info!("Load complete");
        }
    }

    flash.deinit().dbg_err("deinit")?;
    Ok(())
}
