#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::io::{self, BufRead, ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::{Delay, Serial};

use tiva_uart_loader::{Command, Erase, Opcode, Options, ProtectionLevel, Programmer};

type Loader = Programmer<Serial, Delay, IoErrorKind>;

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

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    /// Command to execute, starts the interactive menu if omitted
    #[structopt(subcommand)]
    operation: Option<Operation>,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Read the bootloader vendor id and version
    Version,
    /// Read the commands supported by the bootloader
    Commands,
    /// Read the MCU chip identification number
    ChipId,
    /// Read the flash read protection level
    RdpStatus,
    /// Jump to an address (hex)
    Go {
        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,
    },
    /// Erase flash sectors (hex start and count), or the whole flash
    Erase {
        /// Erase the whole user flash
        #[structopt(long)]
        mass: bool,

        #[structopt(parse(try_from_str = parse_hex_u8), required_unless = "mass")]
        start: Option<u8>,

        #[structopt(parse(try_from_str = parse_hex_u8), required_unless = "mass")]
        count: Option<u8>,
    },
    /// Write a binary image to flash at a base address (hex)
    Write {
        file: PathBuf,

        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,

        /// Stop sending once a chunk is rejected
        #[structopt(long)]
        stop_on_error: bool,
    },
    /// Change the flash read protection level (0 or 1)
    SetRdp { level: u8 },
    /// Jump to the user application
    Jump,
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16)
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let v = parse_hex(s).map_err(|e| e.to_string())?;
    if v > u8::MAX as u32 {
        return Err(format!("0x{:x} does not fit in a byte", v));
    }
    Ok(v as u8)
}

fn parse_level(level: u8) -> anyhow::Result<ProtectionLevel> {
    ProtectionLevel::from_u8(level).ok_or_else(|| anyhow!("Protection level ({}) not supported", level))
}

fn load_image(path: &Path) -> anyhow::Result<Vec<u8>> {
    let image = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;

    info!(
        "Preparing to write {} ({})",
        path.display(),
        bytefmt::format(image.len() as u64)
    );
    debug!("Image header: {}", hex::encode(&image[..image.len().min(16)]));

    Ok(image)
}

impl Operation {
    fn command(self) -> anyhow::Result<(Command, bool)> {
        let c = match self {
            Operation::Version => Command::GetVersion,
            Operation::Commands => Command::GetHelp,
            Operation::ChipId => Command::GetChipId,
            Operation::RdpStatus => Command::GetReadProtection,
            Operation::Go { address } => Command::GoToAddress(address),
            Operation::Erase { mass: true, .. } => Command::EraseFlash(Erase::Mass),
            Operation::Erase { start, count, .. } => {
                let start = start.ok_or_else(|| anyhow!("start sector required"))?;
                Command::EraseFlash(Erase::from_raw(start, count.unwrap_or(0)))
            }
            Operation::Write {
                file,
                address,
                stop_on_error,
            } => {
                let image = load_image(&file)?;
                return Ok((Command::WriteImage { address, image }, stop_on_error));
            }
            Operation::SetRdp { level } => Command::SetReadProtection(parse_level(level)?),
            Operation::Jump => Command::JumpToApplication,
        };

        Ok((c, false))
    }
}

fn run(p: &mut Loader, command: &Command, stop_on_error: bool) -> anyhow::Result<()> {
    let cancel = AtomicBool::new(false);

    let pb = match command {
        Command::WriteImage { image, .. } => {
            let pb = ProgressBar::new(image.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) Writing")
                    .progress_chars("#>-"),
            );
            Some(pb)
        }
        _ => None,
    };

    let outcome = p.execute_with(command, &cancel, |progress| {
        if let Some(pb) = &pb {
            pb.set_position(progress.bytes_complete);
            if !progress.chunk_ok {
                pb.println(format!("Chunk at 0x{:08x} rejected", progress.address));
            }
        }
        if !progress.chunk_ok && stop_on_error {
            cancel.store(true, Ordering::Relaxed);
        }
    });

    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }

    println!("\n{}", outcome?);

    Ok(())
}

/// Read a trimmed line, `None` on end of input
fn prompt(msg: &str) -> anyhow::Result<Option<String>> {
    print!("{}", msg);
    io::stdout().flush()?;

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn prompt_hex(msg: &str) -> anyhow::Result<u32> {
    let s = prompt(msg)?.ok_or_else(|| anyhow!("no input"))?;
    parse_hex(&s).with_context(|| format!("invalid hex value '{}'", s))
}

fn prompt_hex_u8(msg: &str) -> anyhow::Result<u8> {
    let s = prompt(msg)?.ok_or_else(|| anyhow!("no input"))?;
    parse_hex_u8(&s).map_err(|e| anyhow!("invalid value '{}': {}", s, e))
}

/// Gather parameters for a menu selection
fn prompt_command(selector: usize) -> anyhow::Result<Option<Command>> {
    let c = match selector {
        1 => Command::GetVersion,
        2 => Command::GetHelp,
        3 => Command::GetChipId,
        4 => Command::GetReadProtection,
        5 => Command::GoToAddress(prompt_hex("\n   Please enter the address in hex : ")?),
        6 => {
            let start = prompt_hex_u8("\n   Please enter start sector number (hex, FF = mass erase) : ")?;
            let count = if start == tiva_uart_loader::protocol::MASS_ERASE {
                0
            } else {
                prompt_hex_u8("\n   Please enter number of sectors to erase (hex) : ")?
            };
            Command::EraseFlash(Erase::from_raw(start, count))
        }
        7 => {
            let file = prompt("\n   Image file [Application.bin] : ")?
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Application.bin".to_string());
            let image = load_image(Path::new(&file))?;
            let address = prompt_hex("\n   Enter the start address (hex) : ")?;
            Command::WriteImage { address, image }
        }
        8 => {
            let s = prompt("\n   Please enter one of these protection levels : 0,1,2 : ")?
                .ok_or_else(|| anyhow!("no input"))?;
            let level = s.parse::<u8>().with_context(|| format!("invalid level '{}'", s))?;
            Command::SetReadProtection(parse_level(level)?)
        }
        9 => Command::JumpToApplication,
        _ => {
            println!("   Error !!, Please enter a valid command !!");
            return Ok(None);
        }
    };

    Ok(Some(c))
}

fn interactive(p: &mut Loader) -> anyhow::Result<()> {
    let unavailable: Vec<_> = Opcode::ALL
        .iter()
        .filter(|o| !o.is_implemented())
        .map(|o| o.name())
        .collect();

    loop {
        println!("\nTM4C123 Custom Bootloader");
        println!("==============================");
        println!("Which command you need to send to the bootloader :");
        for (i, d) in Command::MENU.iter().enumerate() {
            println!("   {:<52} --> {}", d, i + 1);
        }
        println!("   (declared but unavailable: {})", unavailable.join(", "));

        let line = match prompt("\nEnter the command code (q to quit) : ")? {
            Some(l) if l != "q" => l,
            _ => break,
        };

        let selector = match line.parse::<usize>() {
            Ok(s) => s,
            Err(_) => {
                println!("   Error !!, Please enter a valid command !!");
                continue;
            }
        };

        let result = prompt_command(selector)
            .and_then(|c| c.map(|c| run(p, &c, false)).unwrap_or(Ok(())));
        if let Err(e) = result {
            error!("{:#}", e);
        }

        if prompt("\nPress enter to continue ...")?.is_none() {
            break;
        }

        if let Err(e) = p.clear_input() {
            warn!("Failed to reset input buffer: {}", e);
        }
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .map_err(|e| anyhow!("Error connecting to serial port {}: {:?}", o.port, e))?;

    info!("Port open success");

    match o.operation {
        Some(op) => {
            let (command, stop_on_error) = op.command()?;
            run(&mut p, &command, stop_on_error)
        }
        None => interactive(&mut p),
    }
}
