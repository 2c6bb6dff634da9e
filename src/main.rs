
#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};

use esp_serial_loader::linux::LinuxTransport;
use esp_serial_loader::{LogFacade, Options, Programmer};

/// RAM download block size used by the ROM loader
const RAM_BLOCK_SIZE: usize = 0x1800;

type Loader = Programmer<LinuxTransport, LogFacade>;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Number of sync attempts before giving up
    #[structopt(long, default_value = "5")]
    sync_attempts: u32,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    command: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Connect and synchronise with the bootloader
    Sync,

    /// Read a 32-bit register
    ReadReg {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,
    },

    /// Write a 32-bit register
    WriteReg {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,

        #[structopt(parse(try_from_str = parse_u32))]
        value: u32,

        /// Mask of bits to modify
        #[structopt(long, default_value = "0xFFFFFFFF", parse(try_from_str = parse_u32))]
        mask: u32,

        /// Delay after writing (us)
        #[structopt(long, default_value = "0", parse(try_from_str = parse_u32))]
        delay_us: u32,
    },

    /// Attach the SPI flash
    SpiAttach {
        #[structopt(default_value = "0", parse(try_from_str = parse_u32))]
        config: u32,
    },

    /// Load a binary into RAM
    LoadRam {
        /// Binary file to load
        file: String,

        /// RAM address to load at
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,

        /// Entry point to jump to once loaded (stays in the loader if unset)
        #[structopt(long, parse(try_from_str = parse_u32))]
        entry: Option<u32>,
    },
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn connect(p: &mut Loader, attempts: u32) -> anyhow::Result<()> {
    let mut last = None;

    for i in 0..attempts.max(1) {
        let r = match i {
            0 => p.init(),
            _ => p.sync(),
        };

        match r {
            Ok(_) => return Ok(()),
            Err(e) => {
                debug!("Sync attempt {} failed: {}", i + 1, e);
                last = Some(e);
            }
        }
    }

    match last {
        Some(e) => Err(e).context("Error connecting to bootloader"),
        None => Ok(()),
    }
}

fn load_ram(p: &mut Loader, file: &str, address: u32, entry: Option<u32>)
-> anyhow::Result<()> {
    let data = std::fs::read(file).with_context(|| format!("Error reading {}", file))?;
    let blocks = (data.len() + RAM_BLOCK_SIZE - 1) / RAM_BLOCK_SIZE;

    info!("Loading {} to 0x{:08x} ({} blocks)", bytefmt::format(data.len() as u64), address, blocks);

    p.mem_begin(address, data.len() as u32, RAM_BLOCK_SIZE as u32, blocks as u32)?;

    let pb = ProgressBar::new(data.len() as u64);
    pb.set_style(ProgressStyle::default_bar()
        .template("{bar:40} {bytes}/{total_bytes}")
        .progress_chars("=> "));

    for chunk in data.chunks(RAM_BLOCK_SIZE) {
        p.mem_data(chunk)?;
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();

    match entry {
        Some(e) => info!("Jumping to entry point 0x{:08x}", e),
        None => info!("Load complete, staying in loader"),
    }
    p.mem_end(entry.is_none(), entry.unwrap_or(0))?;

    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port");

    // Device failure categories are routed through the logger
    let mut p: Loader = Programmer::linux_with_log(&o.port, o.baud, o.options, LogFacade)
        .context("Error connecting to serial port")?;

    info!("Connecting to bootloader");
    connect(&mut p, o.sync_attempts)?;
    info!("Bootloader connected!");

    match o.command {
        Operation::Sync => (),
        Operation::ReadReg{ address } => {
            let v = p.read_reg(address)?;
            info!("0x{:08x}: 0x{:08x} ({})", address, v, hex::encode(v.to_le_bytes()));
        },
        Operation::WriteReg{ address, value, mask, delay_us } => {
            p.write_reg(address, value, mask, delay_us)?;
            info!("Wrote 0x{:08x} to 0x{:08x} (mask 0x{:08x})", value, address, mask);
        },
        Operation::SpiAttach{ config } => {
            p.spi_attach(config)?;
            info!("SPI flash attached");
        },
        Operation::LoadRam{ file, address, entry } => {
            load_ram(&mut p, &file, address, entry)?;
        },
    }

    Ok(())
}
