use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fcflash_core::container::{self, AIRFRAME_XML, PARAMETER_XML};
use fcflash_core::crc::firmware_crc;
use fcflash_core::{
    BoardCatalog, ChannelObserver, ContainerBuilder, DeviceKind, Firmware, FlashConfig, FlashEvent,
    FlashObserver, FlashOutcome, FlashSession, TracingObserver, list_ports,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "PX4 board and SiK radio firmware flasher", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// USB board identification rules (JSON)
    #[arg(long, global = true)]
    board_rules: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports and the boards behind them
    Ports {
        /// Include system ports
        #[arg(long)]
        all: bool,
    },
    /// Show what a .px4 or Intel-hex file contains
    Inspect { file: PathBuf },
    /// Wrap a raw binary into a .px4 container
    Pack(PackArgs),
    /// Write the default configuration to a file
    InitConfig { output: PathBuf },
    /// Flash firmware to a board or radio
    Flash(FlashArgs),
}

#[derive(Args, Debug)]
struct PackArgs {
    /// Raw firmware binary
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    board_id: u32,
    #[arg(long)]
    board_revision: Option<u32>,
    /// Largest image the board accepts, in bytes
    #[arg(long)]
    image_maxsize: Option<u64>,
    #[arg(long)]
    version: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    parameter_xml: Option<PathBuf>,
    #[arg(long)]
    airframe_xml: Option<PathBuf>,
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct FlashArgs {
    /// Serial port; detected from USB descriptors when omitted
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    firmware: PathBuf,
    /// Bootloader protocol; detected from the port or the file when omitted
    #[arg(long, value_enum)]
    kind: Option<KindArg>,
    /// Board id the device must report
    #[arg(long)]
    board_id: Option<u32>,
    /// Log every serial frame
    #[arg(long)]
    trace_packets: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Board,
    Radio,
}

impl From<KindArg> for DeviceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Board => DeviceKind::Board,
            KindArg::Radio => DeviceKind::Radio,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => FlashConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FlashConfig::default(),
    };

    let catalog = match &cli.board_rules {
        Some(path) => BoardCatalog::load(path)?,
        None => BoardCatalog::builtin()?,
    };

    match cli.command {
        Command::Ports { all } => ports(&catalog, all),
        Command::Inspect { file } => inspect(&file),
        Command::Pack(args) => pack(args),
        Command::InitConfig { output } => {
            config.save_to_file(&output)?;
            info!(path = %output.display(), "Configuration written");
            Ok(())
        }
        Command::Flash(args) => flash(args, config, &catalog),
    }
}

fn ports(catalog: &BoardCatalog, all: bool) -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for port in ports.iter().filter(|p| all || !p.is_system_port()) {
        let class = catalog.classify(port);
        let usb = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!("{:04X}:{:04X}", vid, pid),
            _ => "-".to_string(),
        };
        let mut flags = Vec::new();
        if class.can_flash() {
            flags.push("flashable");
        }
        if catalog.is_bootloader(port) {
            flags.push("bootloader");
        }
        if port.is_system_port() {
            flags.push("system");
        }
        println!(
            "{:<24} {:<10} {:<22} {}",
            port.name,
            usb,
            class.name,
            flags.join(",")
        );
    }
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    match Firmware::load(path)? {
        Firmware::Container(c) => {
            println!("Format:          px4 container");
            println!("Board id:        {}", c.board_id());
            if let Some(rev) = c.board_revision() {
                println!("Board revision:  {}", rev);
            }
            if let Some(version) = c.version() {
                println!("Version:         {}", version);
            }
            if let Some(git) = c.git_identity() {
                println!("Git identity:    {}", git);
            }
            if let Some(description) = c.description() {
                println!("Description:     {}", description);
            }
            if let Some(summary) = c.summary() {
                println!("Summary:         {}", summary);
            }
            if let Some(time) = c.build_time() {
                println!("Build time:      {}", time);
            }
            for section in c.sections() {
                let image = c.image(&section.key)?;
                println!(
                    "Section {:<14} {} bytes ({})",
                    section.key,
                    image.len(),
                    section.description
                );
                if section.key == container::IMAGE
                    && let Some(max) = c.image_maxsize()
                {
                    println!(
                        "  CRC over {} bytes: 0x{:08X}",
                        max,
                        firmware_crc(&image, max as u32)
                    );
                }
            }
            for key in [PARAMETER_XML, AIRFRAME_XML] {
                if let Some(blob) = c.metadata(key) {
                    match blob.declared_size {
                        Some(size) => println!("Metadata {:<13} {} bytes", key, size),
                        None => println!("Metadata {:<13} present", key),
                    }
                }
            }
        }
        Firmware::Hex(image) => {
            println!("Format:          Intel hex");
            println!("Blocks:          {}", image.len());
            println!("Bytes:           {}", image.total_bytes());
            for block in image.blocks() {
                println!(
                    "  0x{:08X}..0x{:08X} {} bytes",
                    block.address,
                    block.end(),
                    block.data.len()
                );
            }
        }
    }
    Ok(())
}

fn pack(args: PackArgs) -> Result<()> {
    let image = std::fs::read(&args.image)
        .with_context(|| format!("reading {}", args.image.display()))?;

    let build_time = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let mut builder = ContainerBuilder::new(args.board_id)
        .image(&image)?
        .set("build_time", build_time);
    if let Some(rev) = args.board_revision {
        builder = builder.set("board_revision", rev);
    }
    if let Some(max) = args.image_maxsize {
        if image.len() as u64 > max {
            warn!(size = image.len(), max, "Image is larger than image_maxsize");
        }
        builder = builder.set("image_maxsize", max);
    }
    if let Some(version) = &args.version {
        builder = builder.version(version);
    }
    if let Some(description) = &args.description {
        builder = builder.description(description);
    }
    if let Some(path) = &args.parameter_xml {
        builder = builder.parameter_xml(&std::fs::read(path)?)?;
    }
    if let Some(path) = &args.airframe_xml {
        builder = builder.airframe_xml(&std::fs::read(path)?)?;
    }

    builder.write_to(&args.output)?;
    info!(
        path = %args.output.display(),
        board_id = args.board_id,
        bytes = image.len(),
        "Container written"
    );
    Ok(())
}

fn flash(args: FlashArgs, mut config: FlashConfig, catalog: &BoardCatalog) -> Result<()> {
    let firmware = Firmware::load(&args.firmware)?;
    if args.trace_packets {
        config.trace_packets = true;
    }

    let (port, detected) = match args.port.clone().or_else(|| config.port.clone()) {
        Some(port) => {
            let detected = list_ports()
                .ok()
                .and_then(|ports| ports.into_iter().find(|p| p.name == port))
                .and_then(|p| catalog.classify(&p).device_kind());
            (port, detected)
        }
        None => {
            let ports = list_ports()?;
            let (port, class) = catalog
                .flashable(&ports)
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("No flashable board found; pass --port"))?;
            info!(port = %port.name, board = %class.name, "Board detected");
            (port.name.clone(), class.device_kind())
        }
    };
    let kind = args
        .kind
        .map(DeviceKind::from)
        .or(detected)
        .unwrap_or_else(|| firmware.default_kind());
    info!(port = %port, kind = %kind, format = firmware.format_name(), "Starting flash");

    let (observer, events) = ChannelObserver::new();
    let mut session = FlashSession::with_observer(config, Arc::new(observer));
    if let Some(board_id) = args.board_id {
        session = session.with_board_id(board_id);
    }
    let handle = session.spawn(port, firmware, kind);

    let token = handle.cancel_token();
    ctrlc::set_handler(move || {
        eprintln!();
        warn!("Interrupted, stopping before the next block");
        token.cancel();
    })
    .context("installing Ctrl-C handler")?;

    let log = TracingObserver;
    let mut last_pct = None;
    for event in events.iter() {
        match &event {
            FlashEvent::Progress {
                bytes_done,
                bytes_total,
                ..
            } => {
                let pct = bytes_done * 100 / (*bytes_total).max(1);
                if last_pct != Some(pct) {
                    eprint!("\rProgramming {:3}%", pct);
                    last_pct = Some(pct);
                }
                if bytes_done == bytes_total {
                    eprintln!();
                }
            }
            _ => log.on_event(&event),
        }
        if event.is_terminal() {
            break;
        }
    }

    let outcome = handle
        .join()
        .map_err(|_| anyhow!("flash worker panicked"))??;
    match outcome {
        FlashOutcome::Done { bytes, crc } => match crc {
            Some(crc) => println!("Flashed {} bytes, CRC 0x{:08X}", bytes, crc),
            None => println!("Flashed {} bytes", bytes),
        },
        FlashOutcome::Cancelled {
            bytes_done,
            bytes_total,
        } => println!("Cancelled after {} of {} bytes", bytes_done, bytes_total),
    }
    Ok(())
}
