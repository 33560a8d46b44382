//! Types and functions for the command-line interface
//!
//! The commands here wire the library pieces together: port discovery
//! and selection, the session-backed serial monitor, the mock build
//! step, the flash sequence and the project store.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::Args;
use log::info;
use miette::{miette, IntoDiagnostic, Result, WrapErr};
use serialport::SerialPortType;

use crate::{
    board::{boards, find_by_id, Board},
    compiler::{Compiler, MockCompiler},
    connection::{BaudRate, SerialTransport, USB_SERIAL_JTAG_PID},
    console::MessageLog,
    error::Error,
    flasher::FlashSequencer,
    protocol::{ProgressCallbacks, RomClient},
    session::{Consumer, Session},
    sketch::Sketch,
    store::{
        projects::{Project, ProjectStore},
        JsonFileStore,
    },
};

pub use self::config::Config;

pub mod config;
pub mod monitor;
mod serial;

/// Common connection arguments
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "SERIAL_PORT")]
    pub port: Option<String>,
    /// Baud rate at which to communicate with target device
    #[arg(short = 'b', long)]
    pub baud: Option<BaudRate>,
}

/// Arguments naming a sketch and its target board
#[derive(Debug, Args)]
pub struct SketchArgs {
    /// Path to the sketch source file
    pub sketch: PathBuf,
    /// Identifier of the target board
    #[arg(long, default_value = "esp32-dev")]
    pub board: String,
}

fn resolve_baud(args: &ConnectArgs, config: &Config) -> BaudRate {
    args.baud
        .or_else(|| config.baudrate.and_then(BaudRate::from_bps))
        .unwrap_or_default()
}

/// Open the serial port selected by the arguments and configuration.
///
/// The second element reports whether the port is backed by a built-in
/// USB-Serial-JTAG peripheral, which needs a different reset sequence.
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<(SerialTransport, bool)> {
    let port_info = serial::get_serial_port_info(args, config)?;
    let baud = resolve_baud(args, config);

    info!("Serial port: '{}'", port_info.port_name);
    let transport = SerialTransport::open(&port_info.port_name, baud)?;

    let usb_serial_jtag = matches!(
        &port_info.port_type,
        SerialPortType::UsbPort(info) if info.pid == USB_SERIAL_JTAG_PID
    );

    Ok((transport, usb_serial_jtag))
}

/// Print all detected serial ports.
pub fn list_ports() -> Result<()> {
    let ports = serial::detect_usb_serial_ports()?;
    if ports.is_empty() {
        return Err(Error::NoSerial.into());
    }

    for port in ports {
        match &port.port_type {
            SerialPortType::UsbPort(usb) => {
                let product = usb.product.as_deref().unwrap_or("unknown device");
                println!(
                    "{} - {:04x}:{:04x} {}",
                    port.port_name, usb.vid, usb.pid, product
                );
            }
            _ => println!("{}", port.port_name),
        }
    }

    Ok(())
}

/// Print the built-in board catalog.
pub fn list_boards() -> Result<()> {
    for board in boards() {
        println!("{:<24} {}", board.id, board);
    }

    Ok(())
}

/// Run the interactive serial monitor over a fresh session.
pub fn serial_monitor(args: ConnectArgs, config: &Config) -> Result<()> {
    let baud = resolve_baud(&args, config);
    let (transport, _) = connect(&args, config)?;

    let session = Session::new();
    let log = MessageLog::new();

    session.connect(Box::new(transport))?;
    let connected = format!("Connected at {} baud", baud.bps());
    println!("{connected}");
    log.info(connected);

    let handle = session.acquire(Consumer::Console)?;
    monitor::monitor(handle, log.clone())?;

    session.disconnect()?;
    log.info("Disconnected");
    println!("Disconnected");

    Ok(())
}

/// Build a sketch without flashing it.
pub fn compile(args: SketchArgs) -> Result<()> {
    let sketch = load_sketch(&args.sketch)?;
    let board = lookup_board(&args.board)?;

    let artifact = MockCompiler::new().build(&sketch, &board)?;
    println!(
        "Built '{}' for {}: {} bytes at {:#x}",
        sketch.name,
        board,
        artifact.data.len(),
        artifact.flash_offset
    );

    Ok(())
}

/// Arguments for the flash command
#[derive(Debug, Args)]
pub struct FlashArgs {
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
    #[clap(flatten)]
    pub sketch_args: SketchArgs,
    /// Send the payload uncompressed
    #[arg(long)]
    pub no_compress: bool,
}

/// Build a sketch and flash it to the connected device.
pub fn flash(args: FlashArgs, config: &Config) -> Result<()> {
    let sketch = load_sketch(&args.sketch_args.sketch)?;
    let board = lookup_board(&args.sketch_args.board)?;
    let (transport, usb_serial_jtag) = connect(&args.connect_args, config)?;

    let session = Session::new();
    let log = MessageLog::new();
    log.subscribe(Box::new(|message| {
        println!("[{}] {}", message.direction, message.text);
    }));

    session.connect(Box::new(transport))?;

    let mut sequencer = FlashSequencer::new(
        session.clone(),
        log,
        Box::new(MockCompiler::new()),
        Box::new(RomClient::new()),
    )
    .usb_serial_jtag(usb_serial_jtag);
    if args.no_compress {
        sequencer = sequencer.uncompressed();
    }

    let result = sequencer.run(&sketch, &board, &mut WriteProgress::default());
    session.disconnect()?;

    result.map_err(Into::into)
}

/// Reports block-write progress through the logger.
#[derive(Default)]
struct WriteProgress {
    total: usize,
}

impl ProgressCallbacks for WriteProgress {
    fn init(&mut self, addr: u32, total: usize) {
        self.total = total;
        info!("Writing {total} blocks at {addr:#x}");
    }

    fn update(&mut self, current: usize) {
        if self.total > 0 && (current % 32 == 0 || current == self.total) {
            info!("{current}/{} blocks written", self.total);
        }
    }

    fn finish(&mut self) {
        info!("Write finished");
    }
}

fn project_store(config: &Config) -> Result<ProjectStore> {
    let path = config.projects_path()?;
    Ok(ProjectStore::new(Arc::new(JsonFileStore::open(path)?)))
}

/// Arguments for saving a sketch as a project
#[derive(Debug, Args)]
pub struct SaveProjectArgs {
    #[clap(flatten)]
    pub sketch_args: SketchArgs,
    /// Project name; defaults to the sketch file name
    #[arg(long)]
    pub name: Option<String>,
}

/// Save a sketch into the project store.
pub fn save_project(args: SaveProjectArgs, config: &Config) -> Result<()> {
    let sketch = load_sketch(&args.sketch_args.sketch)?;
    let board = lookup_board(&args.sketch_args.board)?;

    let name = args.name.unwrap_or_else(|| sketch.name.clone());
    let project = Project::new(name, sketch.code, board.id);
    project_store(config)?.save(&project)?;

    println!("Saved project '{}' as {}", project.name, project.id);
    Ok(())
}

/// Print all saved projects, most recently updated first.
pub fn list_projects(config: &Config) -> Result<()> {
    let projects = project_store(config)?.list()?;
    if projects.is_empty() {
        println!("No saved projects");
        return Ok(());
    }

    for project in projects {
        println!("{}  {:<24} {}", project.id, project.name, project.board_id);
    }

    Ok(())
}

/// Delete a saved project by its identifier.
pub fn delete_project(id: &str, config: &Config) -> Result<()> {
    if project_store(config)?.delete(id)? {
        println!("Deleted project {id}");
        Ok(())
    } else {
        Err(miette!("No project with id '{id}'"))
    }
}

fn load_sketch(path: &Path) -> Result<Sketch> {
    let code = fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read sketch from {}", path.display()))?;
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sketch".to_string());

    Ok(Sketch::new(&name.to_lowercase().replace(' ', "-"), &name, &code))
}

fn lookup_board(id: &str) -> Result<Board> {
    find_by_id(id).ok_or_else(|| miette!("Unknown board '{id}', see the boards command"))
}
