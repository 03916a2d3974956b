//! A library for working with ESP-IDF partition tables and SPIFFS
//! filesystem images.
//!
//! Two independent components are provided:
//!
//! - [`PartitionTable`]: parse and generate ESP-IDF partition tables in
//!   both their binary and CSV forms, and answer placement questions such
//!   as "where does the application live" and "does this device use OTA".
//! - [`spiffs`]: the geometry and magic-number rules of the ESP32 SPIFFS
//!   on-disk format, a fingerprint-gated build cache around an external
//!   image builder, and a best-effort scanner for file records inside an
//!   existing image.
//!
//! Flashing, serial communication, and tool invocation are deliberately
//! out of scope; callers feed the offsets and image paths produced here
//! into whatever flashing mechanism they use.

#[cfg(feature = "cli")]
pub mod cli;
mod error;
#[cfg(feature = "cli")]
pub mod logging;
pub mod partition_table;
pub mod spiffs;

pub use error::{BuildError, DecodeError, ValidationError};
pub use partition_table::{AppType, CoreType, DataType, Partition, PartitionTable, SubType, Type};
pub use spiffs::SpiffsParameters;
