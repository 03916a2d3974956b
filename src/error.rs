//! Library error types

use std::{io, path::PathBuf};

use miette::Diagnostic;
use thiserror::Error;

/// Errors returned when decoding a partition table from binary or CSV input.
///
/// The binary variants are deliberately distinct: an erased table region and
/// a corrupt one call for different user guidance, even though both end in a
/// full reflash.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("Partition table input is only {0} bytes, shorter than a single 32-byte record")]
    #[diagnostic(
        code(espart::partition_table::too_small),
        help("The read looks truncated; re-read the full 4 KiB partition table region")
    )]
    TooSmall(usize),

    #[error("Partition table region is erased")]
    #[diagnostic(
        code(espart::partition_table::erased),
        help("The chip appears blank; perform a full reflash (bootloader, partition table, and application)")
    )]
    Erased,

    #[error("Partition table does not start with the expected magic bytes")]
    #[diagnostic(
        code(espart::partition_table::invalid_magic),
        help("The partition table is corrupt; perform a full reflash")
    )]
    InvalidMagic,

    #[error("Invalid partition table CSV: {0}")]
    #[diagnostic(code(espart::partition_table::invalid_csv))]
    InvalidCsv(String),
}

/// Invariant violations in an otherwise well-formed partition table.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("Partition '{0}' has zero size")]
    #[diagnostic(code(espart::partition_table::zero_size))]
    ZeroSize(String),

    #[error("Partition '{0}' has zero offset")]
    #[diagnostic(code(espart::partition_table::zero_offset))]
    ZeroOffset(String),

    #[error("Partitions '{0}' and '{1}' overlap")]
    #[diagnostic(code(espart::partition_table::overlap))]
    Overlap(String, String),
}

/// Errors from the filesystem-image build and cache layer.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum BuildError {
    #[error("Filesystem image builder tool not found")]
    #[diagnostic(
        code(espart::spiffs::tool_missing),
        help("Install mkspiffs (or another SPIFFS image packer) and make sure it is on the PATH")
    )]
    ExternalToolMissing,

    #[error("Built image is {actual} bytes but the target partition is {expected} bytes")]
    #[diagnostic(
        code(espart::spiffs::size_mismatch),
        help("The image must match the partition size exactly; check the size passed to the builder")
    )]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Filesystem image builder timed out")]
    #[diagnostic(code(espart::spiffs::timeout))]
    Timeout,

    #[error("Data folder not found: {}", .0.display())]
    #[diagnostic(code(espart::spiffs::data_folder_missing))]
    DataFolderMissing(PathBuf),

    #[error(transparent)]
    #[diagnostic(code(espart::spiffs::io))]
    Io(#[from] io::Error),
}
