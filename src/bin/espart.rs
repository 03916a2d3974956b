use clap::{Parser, Subcommand};
use espart::{
    cli::{
        partition_table, resolve_app, spiffs_inspect, PartitionTableArgs, ResolveAppArgs,
        SpiffsInspectArgs,
    },
    logging::initialize_logger,
};
use log::{debug, LevelFilter};
use miette::Result;

#[derive(Debug, Parser)]
#[command(about, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert a partition table between CSV and binary, or display it
    PartitionTable(PartitionTableArgs),
    /// Resolve the application flash address and OTA support from a table
    ResolveApp(ResolveAppArgs),
    /// Inspect a SPIFFS filesystem image
    SpiffsInspect(SpiffsInspectArgs),
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let args = Cli::parse().subcommand;
    debug!("{:#?}", args);

    match args {
        Commands::PartitionTable(args) => partition_table(args),
        Commands::ResolveApp(args) => resolve_app(args),
        Commands::SpiffsInspect(args) => spiffs_inspect(args),
    }
}
