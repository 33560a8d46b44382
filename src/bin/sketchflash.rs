use clap::{Parser, Subcommand};
use log::{debug, LevelFilter};
use miette::Result;
use sketchflash::{
    cli::{
        compile, config::Config, delete_project, flash, list_boards, list_ports, list_projects,
        save_project, serial_monitor, ConnectArgs, FlashArgs, SaveProjectArgs, SketchArgs,
    },
    logging::initialize_logger,
};

#[derive(Debug, Parser)]
#[command(about, version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List all detected serial ports
    ListPorts,
    /// List the supported boards
    Boards,
    /// Open the serial monitor
    Monitor(ConnectArgs),
    /// Build a sketch without flashing it
    Compile(SketchArgs),
    /// Build a sketch and flash it to a target device
    Flash(FlashArgs),
    /// Save a sketch into the project store
    SaveProject(SaveProjectArgs),
    /// List saved projects
    ListProjects,
    /// Delete a saved project
    DeleteProject {
        /// Identifier of the project to delete
        id: String,
    },
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let args = Cli::parse().subcommand;
    debug!("{args:#?}");

    let config = Config::load()?;

    match args {
        Commands::ListPorts => list_ports(),
        Commands::Boards => list_boards(),
        Commands::Monitor(args) => serial_monitor(args, &config),
        Commands::Compile(args) => compile(args),
        Commands::Flash(args) => flash(args, &config),
        Commands::SaveProject(args) => save_project(args, &config),
        Commands::ListProjects => list_projects(&config),
        Commands::DeleteProject { id } => delete_project(&id, &config),
    }
}
