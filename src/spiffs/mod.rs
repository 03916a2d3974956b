//! SPIFFS filesystem image model for ESP32-family devices
//!
//! This module captures the fixed on-disk geometry of an ESP32 SPIFFS
//! image, the magic-number relationship that ties an image to its geometry,
//! a fingerprint-gated cache around an external image builder, and a
//! best-effort scanner for file records in an existing image.
//!
//! It is deliberately not a SPIFFS filesystem implementation: images are
//! produced by an external `mkspiffs`-equivalent tool (modeled by the
//! [`ImageBuilder`] trait) and consumed opaquely by a flashing layer.

mod builder;
mod cache;
mod scan;

pub use builder::{build_or_reuse_image, BuildOutcome, ImageBuilder, Provenance};
pub use cache::{fingerprint_data_folder, needs_rebuild, BuildCache, Fingerprint};
pub use scan::{locate_file_records, FileRecord, FileRecordScanner};

use crate::error::BuildError;

/// Base constant the per-geometry magic number is derived from.
pub const SPIFFS_MAGIC_BASE: u32 = 0x2014_0529;

/// The fixed geometry of a SPIFFS image.
///
/// The defaults match the ESP-IDF configuration for ESP32-family chips:
/// 256-byte pages inside 4096-byte erase blocks, 32-character object names,
/// 4 bytes of per-object metadata, and a 2-byte per-block magic marker.
///
/// These are not free parameters. The on-disk magic is derived from the
/// geometry (see [`SpiffsParameters::magic`]), so an image built with one
/// geometry is rejected by a reader expecting another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiffsParameters {
    /// Smallest logical write unit inside the filesystem, in bytes.
    pub page_size: u32,
    /// Erase granularity, matching the flash sector size, in bytes.
    pub block_size: u32,
    /// Maximum stored filename length, including the leading `/`.
    pub object_name_len: u32,
    /// Per-object metadata length in bytes.
    pub meta_length: u32,
    /// Whether blocks embed a format-validity magic marker.
    pub use_magic: bool,
    /// Length of the embedded magic marker in bytes.
    pub use_magic_length: u32,
}

impl Default for SpiffsParameters {
    fn default() -> Self {
        SpiffsParameters {
            page_size: 256,
            block_size: 4096,
            object_name_len: 32,
            meta_length: 4,
            use_magic: true,
            use_magic_length: 2,
        }
    }
}

impl SpiffsParameters {
    /// The magic constant a reader expects from an image with this
    /// geometry.
    ///
    /// Computed as `SPIFFS_MAGIC_BASE ^ (block_size << 18) ^ (page_size <<
    /// 8) ^ object_name_len`, with 32-bit wrapping shifts as in the
    /// reference C implementation.
    pub fn magic(&self) -> u32 {
        SPIFFS_MAGIC_BASE
            ^ self.block_size.wrapping_shl(18)
            ^ self.page_size.wrapping_shl(8)
            ^ self.object_name_len
    }

    pub fn pages_per_block(&self) -> u32 {
        self.block_size / self.page_size
    }

    /// Number of whole erase blocks a partition of the given size holds.
    pub fn block_count(&self, partition_size: u32) -> u32 {
        partition_size / self.block_size
    }

    /// An image is compatible with a partition only when its length equals
    /// the partition's declared size exactly.
    pub fn check_image_size(&self, image_len: usize, partition_size: u32) -> Result<(), BuildError> {
        if image_len as u64 != u64::from(partition_size) {
            return Err(BuildError::SizeMismatch {
                expected: u64::from(partition_size),
                actual: image_len as u64,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_magic_is_pinned() {
        // Regression guard: the ESP-IDF default geometry must always
        // produce this exact constant.
        let params = SpiffsParameters::default();
        assert_eq!(params.magic(), 0x6015_0509);
        assert_eq!(
            params.magic(),
            0x2014_0529 ^ (4096 << 18) ^ (256 << 8) ^ 32
        );
    }

    #[test]
    fn magic_tracks_geometry() {
        let default = SpiffsParameters::default();

        let bigger_pages = SpiffsParameters {
            page_size: 512,
            ..default
        };
        assert_ne!(default.magic(), bigger_pages.magic());

        let longer_names = SpiffsParameters {
            object_name_len: 64,
            ..default
        };
        assert_ne!(default.magic(), longer_names.magic());
    }

    #[test]
    fn geometry_helpers() {
        let params = SpiffsParameters::default();

        assert_eq!(params.pages_per_block(), 16);
        assert_eq!(params.block_count(0x128000), 0x128);
    }

    #[test]
    fn image_size_must_match_partition_exactly() {
        let params = SpiffsParameters::default();

        assert!(params.check_image_size(0x128000, 0x128000).is_ok());
        assert!(matches!(
            params.check_image_size(0x128000 - 1, 0x128000),
            Err(BuildError::SizeMismatch {
                expected: 0x128000,
                actual,
            }) if actual == 0x128000 - 1
        ));
    }
}
