//! Rebuild gating for externally built filesystem images
//!
//! External image builders are slow and not byte-deterministic, so a fresh
//! build is only worth (and safe to) run when the source data actually
//! changed. The fingerprint hashes every file's name, content, and
//! modification time; hashing the timestamp deliberately forces a rebuild
//! when a file is merely touched.

use std::{
    fmt::{Display, Formatter},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use log::debug;

/// A content hash summarizing a data folder, stored and compared as a hex
/// string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash every regular file directly inside `folder`: its name, its full
/// content, and its modification time, in name order so the result does
/// not depend on directory listing order.
///
/// Returns `None` when the folder does not exist.
pub fn fingerprint_data_folder(folder: &Path) -> io::Result<Option<Fingerprint>> {
    if !folder.is_dir() {
        return Ok(None);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut hasher = md5::Context::new();
    for path in &files {
        let name = path.file_name().unwrap_or_default();
        hasher.consume(name.to_string_lossy().as_bytes());
        hasher.consume(fs::read(path)?);

        let mtime = fs::metadata(path)?.modified()?;
        let since_epoch = mtime.duration_since(UNIX_EPOCH).unwrap_or_default();
        hasher.consume(since_epoch.as_secs().to_le_bytes());
        hasher.consume(since_epoch.subsec_nanos().to_le_bytes());
    }

    Ok(Some(Fingerprint(format!("{:x}", hasher.compute()))))
}

/// The sole gate deciding whether the external build step runs again or
/// the cached image is reused verbatim. An absent cached fingerprint
/// always means rebuild.
pub fn needs_rebuild(cached: Option<&Fingerprint>, current: &Fingerprint) -> bool {
    cached != Some(current)
}

/// On-disk home of the cached fingerprint.
///
/// Stored next to the image it describes and replaced atomically, so a
/// concurrent reader never observes a half-written cache entry.
#[derive(Debug, Clone)]
pub struct BuildCache {
    path: PathBuf,
}

impl BuildCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The conventional cache location for an image: the image path with a
    /// `.fingerprint` suffix appended.
    pub fn for_image(image_path: &Path) -> Self {
        let mut os = image_path.as_os_str().to_os_string();
        os.push(".fingerprint");
        Self { path: PathBuf::from(os) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the previously stored fingerprint, if any. An unreadable or
    /// missing cache file is treated as "no cache" rather than an error;
    /// the worst that happens is a spurious rebuild.
    pub fn load(&self) -> Option<Fingerprint> {
        match fs::read_to_string(&self.path) {
            Ok(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(Fingerprint(trimmed.to_string()))
                }
            }
            Err(err) => {
                debug!("No usable fingerprint cache at {}: {err}", self.path.display());
                None
            }
        }
    }

    /// Persist `fingerprint` via write-to-temp-then-rename.
    pub fn store(&self, fingerprint: &Fingerprint) -> io::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(fingerprint.as_str().as_bytes())?;
        temp.persist(&self.path)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::OpenOptions, time::Duration};

    use tempfile::TempDir;

    use super::*;

    fn set_mtime(path: &Path, secs: u64) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn missing_folder_has_no_fingerprint() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");

        assert!(fingerprint_data_folder(&missing).unwrap().is_none());
    }

    #[test]
    fn fingerprint_is_independent_of_creation_order() {
        let first = TempDir::new().unwrap();
        fs::write(first.path().join("b.txt"), b"beta").unwrap();
        fs::write(first.path().join("a.txt"), b"alpha").unwrap();

        let second = TempDir::new().unwrap();
        fs::write(second.path().join("a.txt"), b"alpha").unwrap();
        fs::write(second.path().join("b.txt"), b"beta").unwrap();

        for dir in [&first, &second] {
            set_mtime(&dir.path().join("a.txt"), 1_700_000_000);
            set_mtime(&dir.path().join("b.txt"), 1_700_000_001);
        }

        let fp_first = fingerprint_data_folder(first.path()).unwrap().unwrap();
        let fp_second = fingerprint_data_folder(second.path()).unwrap().unwrap();

        assert_eq!(fp_first, fp_second);
    }

    #[test]
    fn touching_a_file_changes_the_fingerprint() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("data.bin");
        fs::write(&file, b"same content").unwrap();

        set_mtime(&file, 1_700_000_000);
        let before = fingerprint_data_folder(dir.path()).unwrap().unwrap();

        // Content untouched, timestamp bumped: still a rebuild trigger.
        set_mtime(&file, 1_700_000_060);
        let after = fingerprint_data_folder(dir.path()).unwrap().unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn content_changes_the_fingerprint() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("data.bin");

        fs::write(&file, b"one").unwrap();
        set_mtime(&file, 1_700_000_000);
        let before = fingerprint_data_folder(dir.path()).unwrap().unwrap();

        fs::write(&file, b"two").unwrap();
        set_mtime(&file, 1_700_000_000);
        let after = fingerprint_data_folder(dir.path()).unwrap().unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn subdirectories_are_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        set_mtime(&dir.path().join("a.txt"), 1_700_000_000);
        let before = fingerprint_data_folder(dir.path()).unwrap().unwrap();

        fs::create_dir(dir.path().join("nested")).unwrap();
        let after = fingerprint_data_folder(dir.path()).unwrap().unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn rebuild_gate_truth_table() {
        let a = Fingerprint("aaaa".into());
        let b = Fingerprint("bbbb".into());

        assert!(needs_rebuild(None, &a));
        assert!(needs_rebuild(Some(&b), &a));
        assert!(!needs_rebuild(Some(&a), &a));
    }

    #[test]
    fn cache_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = BuildCache::new(dir.path().join("image.bin.fingerprint"));

        assert!(cache.load().is_none());

        let fp = Fingerprint("cafebabe".into());
        cache.store(&fp).unwrap();
        assert_eq!(cache.load(), Some(fp));
    }

    #[test]
    fn cache_path_for_image() {
        let cache = BuildCache::for_image(Path::new("/tmp/spiffs.bin"));
        assert_eq!(cache.path(), Path::new("/tmp/spiffs.bin.fingerprint"));
    }
}
