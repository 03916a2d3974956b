//! CLI utilities for the `espart` binary
//!
//! No stability guarantees apply.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use clap::Args;
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use log::warn;
use miette::{IntoDiagnostic, Result, WrapErr};

use crate::{
    spiffs::{locate_file_records, SpiffsParameters},
    PartitionTable,
};

#[derive(Debug, Args)]
pub struct PartitionTableArgs {
    /// Path to a partition table file, in CSV or binary format
    partition_table: PathBuf,
    /// Convert the table to binary format
    #[arg(long, conflicts_with = "to_csv")]
    to_binary: bool,
    /// Convert the table to CSV format
    #[arg(long, conflicts_with = "to_binary")]
    to_csv: bool,
    /// File to write the converted table to, instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ResolveAppArgs {
    /// Path to a partition table file, in CSV or binary format
    partition_table: PathBuf,
}

#[derive(Debug, Args)]
pub struct SpiffsInspectArgs {
    /// Path to a SPIFFS image file
    image: PathBuf,
    /// Declared size of the target partition, for a compatibility check
    #[arg(short, long)]
    size: Option<u32>,
}

fn load_table(path: &Path) -> Result<PartitionTable> {
    let data = fs::read(path)
        .into_diagnostic()
        .wrap_err("Failed to open partition table")?;
    let table = PartitionTable::try_from(data).wrap_err("Failed to parse partition table")?;

    if let Err(err) = table.validate() {
        warn!("Partition table failed validation: {err}");
    }

    Ok(table)
}

/// Convert a partition table between its CSV and binary forms, or display
/// it as a human-readable table.
pub fn partition_table(args: PartitionTableArgs) -> Result<()> {
    let table = load_table(&args.partition_table)?;

    if args.to_binary {
        write_output(&args.output, &table.to_bytes())?;
    } else if args.to_csv {
        let mut csv = Vec::new();
        table.save_csv(&mut csv).into_diagnostic()?;
        write_output(&args.output, &csv)?;
    } else {
        table.pretty_print();
    }

    Ok(())
}

fn write_output(output: &Option<PathBuf>, data: &[u8]) -> Result<()> {
    match output {
        Some(path) => fs::write(path, data)
            .into_diagnostic()
            .wrap_err("Failed to write output file"),
        None => io::stdout().write_all(data).into_diagnostic(),
    }
}

/// Print the flash address the application should be written to, and
/// whether the table reserves OTA bookkeeping space.
pub fn resolve_app(args: ResolveAppArgs) -> Result<()> {
    let table = load_table(&args.partition_table)?;
    let (address, has_ota) = table.resolve_app_address();

    println!("Application address: {address}");
    println!("OTA updates:         {}", if has_ota { "yes" } else { "no" });

    Ok(())
}

/// Show the expected geometry of a SPIFFS image and any path-like records
/// found in its first block.
///
/// The record listing is a best-effort byte scan, not a directory read; a
/// listed name is a hint, not a guarantee the file is mountable.
pub fn spiffs_inspect(args: SpiffsInspectArgs) -> Result<()> {
    let image = fs::read(&args.image)
        .into_diagnostic()
        .wrap_err("Failed to open SPIFFS image")?;
    let params = SpiffsParameters::default();

    println!("Image size:     {} bytes", image.len());
    println!(
        "Geometry:       {} byte pages, {} byte blocks, {} blocks",
        params.page_size,
        params.block_size,
        params.block_count(image.len() as u32),
    );
    println!("Expected magic: {:#010x}", params.magic());

    if let Some(size) = args.size {
        match params.check_image_size(image.len(), size) {
            Ok(()) => println!("Partition fit:  exact match ({size} bytes)"),
            Err(err) => warn!("{err}"),
        }
    }

    let records: Vec<_> = locate_file_records(&image, &params).collect();
    if records.is_empty() {
        println!("No file records found in the first block");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Offset")
                .fg(Color::Red)
                .add_attribute(Attribute::Bold),
            Cell::new("Name")
                .fg(Color::Green)
                .add_attribute(Attribute::Bold),
        ]);
    for record in records {
        table.add_row(vec![
            Cell::new(format!("{:#06x}", record.offset)).fg(Color::Red),
            Cell::new(&record.name).fg(Color::Green),
        ]);
    }
    println!("{table}");

    Ok(())
}
