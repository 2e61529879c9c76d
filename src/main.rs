//! Command-line front end for the MT1939 backdoor.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::{bail, ensure, eyre};
use indicatif::ProgressBar;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mtbackdoor::code::{self, CapstoneDisassembler, CodeEnv, GccToolchain};
use mtbackdoor::config::{TargetLayout, TransportConfig};
use mtbackdoor::device::Device;
use mtbackdoor::hook::{self, HookOptions};
use mtbackdoor::link::{Link, ScsiLink, ScsiLinkConfig, SerialLink};
use mtbackdoor::memmap;
use mtbackdoor::memory::{self, Progress};
use mtbackdoor::sim::SimulatedTarget;
use mtbackdoor::usb;

/// Peek, poke, call and hook code on an MT1939 running the backdoor firmware.
#[derive(Debug, Parser)]
#[clap(version)]
struct Cli {
    /// Bit-bang serial port.
    #[clap(long, conflicts_with_all = ["usb", "simulate"])]
    serial: Option<String>,
    /// Tunnel through vendor SCSI commands, optionally picking a drive.
    #[clap(long, value_name = "VID:PID", num_args = 0..=1, default_missing_value = "")]
    usb: Option<String>,
    /// Talk to an in-process simulated target.
    #[clap(long, conflicts_with = "usb")]
    simulate: bool,
    /// Attempts per command before giving up.
    #[clap(long, global = true, value_parser = parse_int::parse::<u32>)]
    retries: Option<u32>,
    #[clap(long, short('v'), global = true)]
    verbose: bool,

    #[clap(subcommand)]
    cmd: SubCmd,
}

#[derive(Debug, Parser)]
enum SubCmd {
    /// Lists connected USB mass storage devices.
    Devices,
    /// Prints the signature line the firmware answered the handshake with.
    Signature,
    Peek {
        #[clap(value_parser = parse_int::parse::<u32>)]
        address: u32,
    },
    Poke {
        #[clap(value_parser = parse_int::parse::<u32>)]
        address: u32,
        #[clap(value_parser = parse_int::parse::<u32>)]
        word: u32,
    },
    /// Reads memory and prints a hex dump, or saves it to a file.
    Dump {
        #[clap(value_parser = parse_int::parse::<u32>)]
        address: u32,
        #[clap(value_parser = parse_int::parse::<u32>)]
        size: u32,
        #[clap(long, short)]
        out: Option<PathBuf>,
    },
    /// Fills words with a repeated pattern.
    Fill {
        #[clap(value_parser = parse_int::parse::<u32>)]
        address: u32,
        #[clap(value_parser = parse_int::parse::<u32>)]
        word: u32,
        #[clap(value_parser = parse_int::parse::<u32>)]
        count: u32,
    },
    /// Searches memory for a hex byte string.
    Find {
        #[clap(value_parser = parse_int::parse::<u32>)]
        address: u32,
        #[clap(value_parser = parse_int::parse::<u32>)]
        size: u32,
        pattern: String,
        /// Bytes of context to show around each match.
        #[clap(long, default_value_t = 8)]
        context: usize,
    },
    /// Shows or moves the RAM overlay window.
    Overlay {
        #[clap(value_parser = parse_int::parse::<u32>, requires = "words")]
        address: Option<u32>,
        #[clap(value_parser = parse_int::parse::<u32>)]
        words: Option<u32>,
        #[clap(long, conflicts_with = "address")]
        off: bool,
    },
    /// Shows or sets the handler of an exception vector.
    Ivt {
        #[clap(value_parser = parse_int::parse::<u32>)]
        vector: u32,
        #[clap(value_parser = parse_int::parse::<u32>)]
        handler: Option<u32>,
    },
    /// Calls a function; set bit 0 of the address for Thumb code.
    Call {
        #[clap(value_parser = parse_int::parse::<u32>)]
        address: u32,
        #[clap(value_parser = parse_int::parse::<u32>, default_value = "0")]
        r0: u32,
    },
    /// Compiles a C++ expression, runs it, and prints its value.
    Evalc {
        expression: String,
        #[clap(long, value_parser = parse_int::parse::<u32>, default_value = "0")]
        arg: u32,
    },
    /// Hooks the Thumb instruction at ADDRESS with a C++ handler body.
    Hook {
        #[clap(value_parser = parse_int::parse::<u32>)]
        address: u32,
        handler: String,
        /// Don't run the displaced instruction after the handler.
        #[clap(long)]
        replace: bool,
    },
    /// Returns control to the stock firmware.
    Exit,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let SubCmd::Devices = cli.cmd {
        return list_devices().await;
    }

    let mut config = TransportConfig::default();
    if let Some(retries) = cli.retries {
        ensure!(retries > 0, "--retries must be at least 1");
        config.retry_limit = retries;
    }

    if cli.simulate {
        run(SimulatedTarget::new(), config, cli.cmd).await
    } else if let Some(path) = &cli.serial {
        run(SerialLink::open(path)?, config, cli.cmd).await
    } else if let Some(filter) = &cli.usb {
        let mut usb_config = ScsiLinkConfig::default();
        (usb_config.vendor_id, usb_config.product_id) = parse_vid_pid(filter)?;
        run(ScsiLink::open(usb_config).await?, config, cli.cmd).await
    } else {
        bail!("pick a target with --serial, --usb or --simulate")
    }
}

async fn list_devices() -> Result<()> {
    for dev in usb::enumerate_usb_storage_devices().await? {
        println!(
            "{:04x}:{:04x}  {} {}",
            dev.vendor_id(),
            dev.product_id(),
            dev.manufacturer_string().unwrap_or("?"),
            dev.product_string().unwrap_or("?")
        );
    }
    Ok(())
}

fn parse_vid_pid(filter: &str) -> Result<(Option<u16>, Option<u16>)> {
    if filter.is_empty() {
        return Ok((None, None));
    }
    let (vid, pid) = filter
        .split_once(':')
        .ok_or_else(|| eyre!("expected VID:PID, got {filter:?}"))?;
    Ok((
        Some(u16::from_str_radix(vid, 16)?),
        Some(u16::from_str_radix(pid, 16)?),
    ))
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    ensure!(
        !digits.is_empty()
            && digits.len() % 2 == 0
            && digits.chars().all(|c| c.is_ascii_hexdigit()),
        "pattern must be an even number of hex digits"
    );
    (0..digits.len())
        .step_by(2)
        .map(|i| -> Result<u8> { Ok(u8::from_str_radix(&digits[i..i + 2], 16)?) })
        .collect()
}

async fn run<L: Link>(link: L, config: TransportConfig, cmd: SubCmd) -> Result<()> {
    let mut device = Device::open(link, config).await?;
    let layout = TargetLayout::default();
    let disassembler = CapstoneDisassembler;

    match cmd {
        SubCmd::Devices => list_devices().await?,
        SubCmd::Signature => {
            print!("{}", String::from_utf8_lossy(device.signature()));
        }
        SubCmd::Peek { address } => {
            println!("{:08x}", device.peek(address).await?);
        }
        SubCmd::Poke { address, word } => {
            device.poke(address, word).await?;
        }
        SubCmd::Dump { address, size, out } => {
            let bar = ProgressBar::new(u64::from(size));
            let mut progress =
                Progress::new(Duration::from_millis(100), |done, _| bar.set_position(done));
            let data =
                memory::read_block_with_progress(&mut device, address, size, &mut progress).await?;
            bar.finish_and_clear();
            match out {
                Some(path) => {
                    tokio::fs::write(&path, &data).await?;
                    info!("wrote {} bytes to {}", data.len(), path.display());
                }
                None => print!("{}", memory::hexdump(&data, address)),
            }
        }
        SubCmd::Fill { address, word, count } => {
            memory::fill(&mut device, address, word, count).await?;
        }
        SubCmd::Find {
            address,
            size,
            pattern,
            context,
        } => {
            let pattern = parse_hex(&pattern)?;
            for hit in memory::search_block(&mut device, address, size, &pattern, context).await? {
                println!(
                    "{:08x}  {} [{}] {}",
                    hit.address,
                    hex(&hit.before),
                    hex(&pattern),
                    hex(&hit.after)
                );
            }
        }
        SubCmd::Overlay { address, words, off } => {
            if off {
                memmap::overlay_disable(&mut device).await?;
            } else if let (Some(address), Some(words)) = (address, words) {
                memmap::overlay_set(&mut device, address, words).await?;
            }
            let window = memmap::overlay_get(&mut device).await?;
            println!(
                "{:08x} +{} words ({})",
                window.address,
                window.wordcount,
                if window.enabled { "on" } else { "off" }
            );
        }
        SubCmd::Ivt { vector, handler } => {
            if let Some(handler) = handler {
                memmap::ivt_set(&mut device, &disassembler, vector, handler).await?;
            }
            let target = memmap::ivt_get(&mut device, &disassembler, vector).await?;
            println!("{vector:08x} -> {target:08x}");
        }
        SubCmd::Call { address, r0 } => {
            let (r0, r1) = device.blx(address, r0).await?;
            println!("r0={r0:08x} r1={r1:08x}");
        }
        SubCmd::Evalc { expression, arg } => {
            let toolchain = GccToolchain::default();
            let env = CodeEnv::for_layout(&layout);
            let value =
                code::evalc(&mut device, &toolchain, &env, layout.shell_code, &expression, arg)
                    .await?;
            if let Some(value) = value {
                println!("0x{value:08x} ({value})");
            }
        }
        SubCmd::Hook {
            address,
            handler,
            replace,
        } => {
            let toolchain = GccToolchain::default();
            let options = HookOptions {
                replace_one_instruction: replace,
                ..HookOptions::new(&layout)
            };
            let installed = hook::overlay_hook(
                &mut device,
                &toolchain,
                &disassembler,
                address,
                &handler,
                &options,
            )
            .await?;
            println!(
                "handler {:#x} bytes at {:08x}, ISR {:#x} bytes at {:08x}, returning to {:08x}",
                installed.handler_len,
                installed.handler_address,
                installed.isr_len,
                installed.isr_address,
                installed.return_address
            );
            println!("{}", installed.diff);
        }
        SubCmd::Exit => {
            device.exit().await?;
            return Ok(());
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}
