use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use sboot_core::catalog::RegionCatalog;
use sboot_core::dump::{DumpEngine, ProgressMonitor, TransferRequest};
use sboot_core::session::{ProtocolError, Session, SessionConfig};
use sboot_core::sink::FileSink;
use sboot_core::transport::{NusbTransport, SerialTransport, Transport, UsbTarget};
use tracing::{error, info, warn};

type DeviceSession = Session<Box<dyn Transport>>;

#[derive(Parser, Debug)]
#[command(author, version, about = "S-Boot Upload Mode RAM dump tool (Pure Rust)", long_about = None)]
struct Args {
    /// Use a serial port (e.g. /dev/ttyACM0, COM5) instead of raw USB
    #[arg(long, global = true)]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// USB vendor id (hex)
    #[arg(long, global = true, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// USB product id (hex)
    #[arg(long, global = true, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Session configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write the effective configuration to this file
    #[arg(long, global = true)]
    write_config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the device's region table
    ShowTable {
        /// Parse a previously saved table instead of asking the device
        #[arg(long)]
        file: Option<PathBuf>,

        /// Save the raw table
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Dump memory
    Dump {
        #[command(subcommand)]
        target: DumpTarget,
    },
}

#[derive(Subcommand, Debug)]
enum DumpTarget {
    /// Everything between the lowest and highest region address
    Full {
        #[arg(short, long, default_value = "range.bin")]
        output: PathBuf,
    },
    /// Explicit range, both ends inclusive (hex)
    Range {
        #[arg(value_parser = parse_hex_u64)]
        start: u64,
        #[arg(value_parser = parse_hex_u64)]
        end: u64,
        #[arg(short, long, default_value = "range.bin")]
        output: PathBuf,
        /// Continue an interrupted dump this many bytes in
        #[arg(long, value_parser = parse_hex_u64)]
        resume_offset: Option<u64>,
    },
    /// One region by table index
    Partition {
        index: usize,
        #[arg(short, long, default_value = "memory")]
        dir: PathBuf,
    },
    /// Every region, one file each
    All {
        #[arg(short, long, default_value = "memory")]
        dir: PathBuf,
    },
}

fn parse_hex_u64(s: &str) -> Result<u64, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(path) = &args.write_config {
        config.save_to_file(path)?;
        info!(path = %path.display(), "Configuration written");
    }

    let Some(command) = &args.command else {
        if args.write_config.is_some() {
            return Ok(());
        }
        let mut session = connect(&args, config)?;
        print_regions(&mut session, &mut std::io::stdout())?;
        println!();
        println!("Run 'sboot dump all' to dump all regions");
        println!("Run 'sboot dump partition <index>' to dump one region");
        println!("Run 'sboot dump range <start> <end>' to dump a memory range");
        println!("Run 'sboot dump full' to dump everything the table covers");
        println!("Run 'sboot show-table --file <table>' to print a saved table");
        return Ok(());
    };

    match command {
        Cmd::ShowTable {
            file: Some(file), ..
        } => {
            let raw = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            match RegionCatalog::parse(&raw) {
                Ok(catalog) => print!("{}", catalog),
                Err(e) => {
                    print!("{}", e.partial);
                    bail!("table is malformed: {}", e);
                }
            }
        }
        Cmd::ShowTable { file: None, save } => {
            let mut session = connect(&args, config)?;
            let printed = print_regions(&mut session, &mut std::io::stdout());
            if let (Some(path), Some(catalog)) = (save, session.catalog()) {
                std::fs::write(path, catalog.raw_table())?;
                info!(path = %path.display(), "Region table saved");
            }
            session.close();
            printed?;
        }
        Cmd::Dump { target } => {
            let mut session = connect(&args, config)?;
            dump(&mut session, target)?;
            session.close();
        }
    }
    Ok(())
}

fn connect(args: &Args, config: SessionConfig) -> Result<DeviceSession> {
    let transport: Box<dyn Transport> = match &args.serial {
        Some(path) => Box::new(SerialTransport::open(path, args.baud)?),
        None => {
            let defaults = UsbTarget::default();
            Box::new(NusbTransport::open_target(UsbTarget {
                vid: args.vid.unwrap_or(defaults.vid),
                pid: args.pid.unwrap_or(defaults.pid),
            })?)
        }
    };

    info!("Connecting to {}...", transport.describe());
    let mut session = Session::new(transport, config);
    let variant = session.connect()?;
    info!(variant = %variant, "Device in upload mode");
    Ok(session)
}

/// Print the region table. A malformed table still prints the regions
/// parsed before the bad entry.
fn print_regions<T: Transport>(session: &mut Session<T>, out: &mut impl Write) -> Result<()> {
    match session.regions() {
        Ok(catalog) => write!(out, "{}", catalog)?,
        Err(e @ ProtocolError::MalformedTable { .. }) => {
            if let Some(partial) = session.catalog() {
                write!(out, "{}", partial)?;
            }
            bail!("table is malformed: {}", e);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn dump(session: &mut DeviceSession, target: &DumpTarget) -> Result<()> {
    match target {
        DumpTarget::Full { output } => {
            let (start, _) = session
                .regions()?
                .span()
                .context("region table is empty")?;
            let mut sink = FileSink::create(output, start)?;
            run_with_progress(session, &TransferRequest::Full, &mut sink, output)?;
        }
        DumpTarget::Range {
            start,
            end,
            output,
            resume_offset,
        } => {
            if end < start {
                bail!("end 0x{:x} is below start 0x{:x}", end, start);
            }
            let skip = resume_offset.unwrap_or(0);
            let mut sink = if skip > 0 {
                FileSink::resume(output, *start)?
            } else {
                FileSink::create(output, *start)?
            };
            let request = TransferRequest::Range {
                start_address: start.saturating_add(skip),
                end_address: end.saturating_add(1),
            };
            run_with_progress(session, &request, &mut sink, output)?;
        }
        DumpTarget::Partition { index, dir } => {
            std::fs::create_dir_all(dir)?;
            dump_region(session, *index, dir)?;
        }
        DumpTarget::All { dir } => {
            std::fs::create_dir_all(dir)?;
            let count = session.regions()?.len();
            for index in 0..count {
                dump_region(session, index, dir)?;
            }
            info!("Done. Dumped memory has been written to {}", dir.display());
        }
    }
    Ok(())
}

fn dump_region(session: &mut DeviceSession, index: usize, dir: &Path) -> Result<()> {
    let catalog = session.regions()?;
    let Some(region) = catalog.get(index).cloned() else {
        bail!("region {} does not exist ({} regions)", index, catalog.len());
    };
    let path = dir.join(region.file_name());
    let mut sink = FileSink::create(&path, region.start_address)?;
    run_with_progress(
        session,
        &TransferRequest::Region {
            region_index: index,
        },
        &mut sink,
        &path,
    )
}

/// Run one transfer while a second thread renders the progress snapshot.
fn run_with_progress(
    session: &mut DeviceSession,
    request: &TransferRequest,
    sink: &mut FileSink,
    path: &Path,
) -> Result<()> {
    let monitor = ProgressMonitor::new();
    let engine = DumpEngine::new().with_progress(monitor.clone());
    let done = AtomicBool::new(false);

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(format!("File: \"{}\"", path.display()));

    let result = std::thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                let snapshot = monitor.snapshot();
                pb.set_length(snapshot.bytes_total);
                pb.set_position(snapshot.bytes_transferred);
                std::thread::sleep(Duration::from_millis(100));
            }
        });
        let result = engine.run(session, request, sink);
        done.store(true, Ordering::Release);
        result
    });

    let snapshot = monitor.snapshot();
    pb.set_length(snapshot.bytes_total);
    pb.set_position(snapshot.bytes_transferred);

    match result {
        Ok(progress) => {
            pb.finish();
            info!(
                bytes = progress.bytes_transferred,
                "Dumped memory was written to {}",
                path.display()
            );
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            if let Some(offset) = e.last_good_offset() {
                warn!(
                    "{} is valid for the first 0x{:x} bytes of this transfer",
                    path.display(),
                    offset
                );
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sboot_core::catalog::{AddressWidth, TableBuilder};
    use sboot_core::protocol::ChipsetVariant;
    use sboot_core::transport::MockDevice;

    fn ready(device: MockDevice) -> Session<MockDevice> {
        let config = SessionConfig {
            io_timeout_ms: 5,
            ..Default::default()
        };
        let mut session = Session::new(device, config);
        session.connect().unwrap();
        session
    }

    #[test]
    fn test_print_regions_lists_table() {
        let mut session = ready(MockDevice::new(ChipsetVariant::Sboot64));
        let mut out = Vec::new();
        print_regions(&mut session, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("SM-MOCK"));
        assert!(text.contains("RAM"));
    }

    #[test]
    fn test_print_regions_shows_partial_table_when_malformed() {
        let table = TableBuilder::new("DEV", AddressWidth::Bits32)
            .region("BOOT", 0x1000, 0x200)
            .raw_entry("BAD", 0x9000, 0x10)
            .build();
        let device = MockDevice::new(ChipsetVariant::Sboot32).with_table(&table, 0x100);
        let mut session = ready(device);
        let mut out = Vec::new();

        let err = print_regions(&mut session, &mut out).unwrap_err();
        assert!(err.to_string().contains("malformed"));
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("BOOT"));
        assert!(!text.contains("BAD"));
    }
}
