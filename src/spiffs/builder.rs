//! Image construction with fingerprint-gated caching
//!
//! The actual packing of a data folder into a SPIFFS image is delegated to
//! an external `mkspiffs`-equivalent tool behind the [`ImageBuilder`]
//! trait. This module decides *whether* that tool runs at all, validates
//! its output, and commits the result atomically.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info, warn};

use super::cache::{fingerprint_data_folder, needs_rebuild, BuildCache, Fingerprint};
use crate::error::BuildError;

/// Collaborator contract for an external filesystem-image packer.
///
/// Given a folder of files and a target byte size, an implementation must
/// produce a single binary blob of exactly `size` bytes at `out_path` that
/// a SPIFFS-compatible reader can mount, containing each file in the
/// folder addressable as `/<filename>`. The call blocks for at most
/// `timeout`; on expiry it must fail with [`BuildError::Timeout`] and must
/// not leave a partial file behind. A missing tool is reported as
/// [`BuildError::ExternalToolMissing`].
pub trait ImageBuilder {
    fn build(
        &self,
        data_folder: &Path,
        out_path: &Path,
        size: u32,
        timeout: Duration,
    ) -> Result<(), BuildError>;
}

/// How the returned image came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// The data folder is unchanged; the previously built image was reused
    /// without invoking the builder.
    Cached,
    /// The builder ran and produced a fresh, size-validated image.
    Rebuilt,
    /// The builder failed but a previously built image was still on disk
    /// and the caller opted into using it.
    StaleFallback,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Provenance::Cached => "cached",
            Provenance::Rebuilt => "rebuilt",
            Provenance::StaleFallback => "stale-fallback",
        };

        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub image_path: PathBuf,
    pub provenance: Provenance,
}

/// Produce a valid filesystem image for `output_path`, rebuilding only
/// when the data folder's fingerprint no longer matches the cache.
///
/// The builder writes into a temporary file next to `output_path`; only a
/// result of exactly `partition_size` bytes is renamed into place and its
/// fingerprint persisted. On any failure the previous image and cache
/// entry are left untouched. With `allow_stale` set, a failed rebuild
/// falls back to the previous image — reported as
/// [`Provenance::StaleFallback`] and logged as a warning, never silently.
pub fn build_or_reuse_image(
    data_folder: &Path,
    output_path: &Path,
    partition_size: u32,
    builder: &dyn ImageBuilder,
    cache: &BuildCache,
    timeout: Duration,
    allow_stale: bool,
) -> Result<BuildOutcome, BuildError> {
    let current = fingerprint_data_folder(data_folder)?
        .ok_or_else(|| BuildError::DataFolderMissing(data_folder.to_path_buf()))?;

    if !needs_rebuild(cache.load().as_ref(), &current) && output_path.exists() {
        debug!(
            "Data folder unchanged, reusing filesystem image at {}",
            output_path.display()
        );
        return Ok(BuildOutcome {
            image_path: output_path.to_path_buf(),
            provenance: Provenance::Cached,
        });
    }

    info!("Data folder changed, rebuilding filesystem image");
    match run_builder(data_folder, output_path, partition_size, builder, cache, timeout, &current) {
        Ok(()) => Ok(BuildOutcome {
            image_path: output_path.to_path_buf(),
            provenance: Provenance::Rebuilt,
        }),
        Err(err) if allow_stale && output_path.exists() => {
            warn!(
                "Filesystem image rebuild failed ({err}); falling back to the previous image at {}",
                output_path.display()
            );
            Ok(BuildOutcome {
                image_path: output_path.to_path_buf(),
                provenance: Provenance::StaleFallback,
            })
        }
        Err(err) => Err(err),
    }
}

fn run_builder(
    data_folder: &Path,
    output_path: &Path,
    partition_size: u32,
    builder: &dyn ImageBuilder,
    cache: &BuildCache,
    timeout: Duration,
    current: &Fingerprint,
) -> Result<(), BuildError> {
    let dir = output_path.parent().unwrap_or_else(|| Path::new("."));

    // The temp file lives in the output directory so the final rename
    // stays on one filesystem. If the builder fails or the size check
    // rejects its output, dropping the handle removes the partial file.
    let temp = tempfile::Builder::new()
        .prefix(".spiffs-build")
        .tempfile_in(dir)?;
    let temp_path = temp.path().to_path_buf();

    builder.build(data_folder, &temp_path, partition_size, timeout)?;

    let actual = fs::metadata(&temp_path)?.len();
    if actual != u64::from(partition_size) {
        return Err(BuildError::SizeMismatch {
            expected: u64::from(partition_size),
            actual,
        });
    }

    temp.persist(output_path).map_err(|e| e.error)?;
    cache.store(current)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tempfile::TempDir;

    use super::*;

    /// Writes `size_delta`-adjusted output and counts invocations.
    struct MockBuilder {
        calls: Cell<usize>,
        size_delta: i64,
        fail_with: Option<fn() -> BuildError>,
    }

    impl MockBuilder {
        fn exact() -> Self {
            MockBuilder {
                calls: Cell::new(0),
                size_delta: 0,
                fail_with: None,
            }
        }

        fn wrong_size() -> Self {
            MockBuilder {
                calls: Cell::new(0),
                size_delta: -1,
                fail_with: None,
            }
        }

        fn failing(err: fn() -> BuildError) -> Self {
            MockBuilder {
                calls: Cell::new(0),
                size_delta: 0,
                fail_with: Some(err),
            }
        }
    }

    impl ImageBuilder for MockBuilder {
        fn build(
            &self,
            _data_folder: &Path,
            out_path: &Path,
            size: u32,
            _timeout: Duration,
        ) -> Result<(), BuildError> {
            self.calls.set(self.calls.get() + 1);
            if let Some(err) = self.fail_with {
                return Err(err());
            }

            let len = (i64::from(size) + self.size_delta) as usize;
            fs::write(out_path, vec![0xFF; len])?;
            Ok(())
        }
    }

    const SIZE: u32 = 8192;
    const TIMEOUT: Duration = Duration::from_secs(30);

    struct Fixture {
        _dir: TempDir,
        data: PathBuf,
        output: PathBuf,
        cache: BuildCache,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        fs::create_dir(&data).unwrap();
        fs::write(data.join("config.json"), b"{}").unwrap();

        let output = dir.path().join("spiffs.bin");
        let cache = BuildCache::for_image(&output);

        Fixture {
            _dir: dir,
            data,
            output,
            cache,
        }
    }

    #[test]
    fn first_build_runs_the_builder() {
        let fx = fixture();
        let builder = MockBuilder::exact();

        let outcome = build_or_reuse_image(
            &fx.data, &fx.output, SIZE, &builder, &fx.cache, TIMEOUT, false,
        )
        .unwrap();

        assert_eq!(outcome.provenance, Provenance::Rebuilt);
        assert_eq!(builder.calls.get(), 1);
        assert_eq!(fs::metadata(&fx.output).unwrap().len(), u64::from(SIZE));
        assert!(fx.cache.load().is_some());
    }

    #[test]
    fn unchanged_data_reuses_the_cached_image() {
        let fx = fixture();
        let builder = MockBuilder::exact();

        build_or_reuse_image(&fx.data, &fx.output, SIZE, &builder, &fx.cache, TIMEOUT, false)
            .unwrap();
        let outcome = build_or_reuse_image(
            &fx.data, &fx.output, SIZE, &builder, &fx.cache, TIMEOUT, false,
        )
        .unwrap();

        assert_eq!(outcome.provenance, Provenance::Cached);
        assert_eq!(builder.calls.get(), 1);
    }

    #[test]
    fn changed_data_triggers_a_rebuild() {
        let fx = fixture();
        let builder = MockBuilder::exact();

        build_or_reuse_image(&fx.data, &fx.output, SIZE, &builder, &fx.cache, TIMEOUT, false)
            .unwrap();
        fs::write(fx.data.join("extra.txt"), b"new file").unwrap();

        let outcome = build_or_reuse_image(
            &fx.data, &fx.output, SIZE, &builder, &fx.cache, TIMEOUT, false,
        )
        .unwrap();

        assert_eq!(outcome.provenance, Provenance::Rebuilt);
        assert_eq!(builder.calls.get(), 2);
    }

    #[test]
    fn size_mismatch_is_a_hard_failure() {
        let fx = fixture();
        let builder = MockBuilder::wrong_size();

        let err = build_or_reuse_image(
            &fx.data, &fx.output, SIZE, &builder, &fx.cache, TIMEOUT, false,
        )
        .unwrap_err();

        assert!(matches!(err, BuildError::SizeMismatch { .. }));
        // Nothing was committed: no image, no cache entry.
        assert!(!fx.output.exists());
        assert!(fx.cache.load().is_none());
    }

    #[test]
    fn failed_rebuild_leaves_previous_image_untouched() {
        let fx = fixture();

        build_or_reuse_image(
            &fx.data,
            &fx.output,
            SIZE,
            &MockBuilder::exact(),
            &fx.cache,
            TIMEOUT,
            false,
        )
        .unwrap();
        let before = fs::read(&fx.output).unwrap();

        fs::write(fx.data.join("extra.txt"), b"changed").unwrap();
        let err = build_or_reuse_image(
            &fx.data,
            &fx.output,
            SIZE,
            &MockBuilder::failing(|| BuildError::ExternalToolMissing),
            &fx.cache,
            TIMEOUT,
            false,
        )
        .unwrap_err();

        assert!(matches!(err, BuildError::ExternalToolMissing));
        assert_eq!(fs::read(&fx.output).unwrap(), before);
    }

    #[test]
    fn stale_fallback_is_opt_in() {
        let fx = fixture();

        build_or_reuse_image(
            &fx.data,
            &fx.output,
            SIZE,
            &MockBuilder::exact(),
            &fx.cache,
            TIMEOUT,
            false,
        )
        .unwrap();

        fs::write(fx.data.join("extra.txt"), b"changed").unwrap();
        let outcome = build_or_reuse_image(
            &fx.data,
            &fx.output,
            SIZE,
            &MockBuilder::failing(|| BuildError::Timeout),
            &fx.cache,
            TIMEOUT,
            true,
        )
        .unwrap();

        assert_eq!(outcome.provenance, Provenance::StaleFallback);
        assert_eq!(outcome.image_path, fx.output);

        // A later successful rebuild still happens; the stale fallback did
        // not refresh the cache entry.
        let builder = MockBuilder::exact();
        let outcome = build_or_reuse_image(
            &fx.data, &fx.output, SIZE, &builder, &fx.cache, TIMEOUT, false,
        )
        .unwrap();
        assert_eq!(outcome.provenance, Provenance::Rebuilt);
        assert_eq!(builder.calls.get(), 1);
    }

    #[test]
    fn stale_fallback_without_previous_image_fails() {
        let fx = fixture();

        let err = build_or_reuse_image(
            &fx.data,
            &fx.output,
            SIZE,
            &MockBuilder::failing(|| BuildError::ExternalToolMissing),
            &fx.cache,
            TIMEOUT,
            true,
        )
        .unwrap_err();

        assert!(matches!(err, BuildError::ExternalToolMissing));
    }

    #[test]
    fn missing_data_folder_is_reported() {
        let fx = fixture();
        let missing = fx.data.join("nope");

        let err = build_or_reuse_image(
            &missing,
            &fx.output,
            SIZE,
            &MockBuilder::exact(),
            &fx.cache,
            TIMEOUT,
            false,
        )
        .unwrap_err();

        assert!(matches!(err, BuildError::DataFolderMissing(path) if path == missing));
    }
}
