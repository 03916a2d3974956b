//! Best-effort scan for file records in a SPIFFS image
//!
//! This is an inspection aid, not a filesystem reader: it pattern-matches
//! path-like byte sequences in the image's first block (where the object
//! lookup pages live) without decoding the real object index. A match does
//! not prove the file is reachable through the filesystem's lookup table,
//! and overlapping or duplicate matches are reported as-is.

use super::SpiffsParameters;

/// A path-like byte sequence found in the image, with the offset it was
/// seen at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub offset: usize,
    pub name: String,
}

/// Scan the first block of `image` for byte sequences shaped like stored
/// paths: a `/` followed by up to `object_name_len - 1` characters from
/// `[A-Za-z0-9._-]`, terminated by a NUL or any other disallowed byte.
///
/// The returned iterator is lazy and restartable (it is `Clone`).
pub fn locate_file_records<'a>(
    image: &'a [u8],
    params: &SpiffsParameters,
) -> FileRecordScanner<'a> {
    let end = image.len().min(params.block_size as usize);

    FileRecordScanner {
        block: &image[..end],
        pos: 0,
        max_name_len: params.object_name_len as usize,
    }
}

#[derive(Debug, Clone)]
pub struct FileRecordScanner<'a> {
    block: &'a [u8],
    pos: usize,
    max_name_len: usize,
}

impl Iterator for FileRecordScanner<'_> {
    type Item = FileRecord;

    fn next(&mut self) -> Option<FileRecord> {
        while self.pos < self.block.len() {
            let start = self.pos;
            self.pos += 1;

            if self.block[start] != b'/' {
                continue;
            }

            let limit = (start + self.max_name_len).min(self.block.len());
            let mut end = start + 1;
            while end < limit && is_name_byte(self.block[end]) {
                end += 1;
            }

            // A lone slash is not a name.
            if end > start + 1 {
                let name = String::from_utf8_lossy(&self.block[start..end]).into_owned();
                return Some(FileRecord { offset: start, name });
            }
        }

        None
    }
}

fn is_name_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-' | b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with(parts: &[(usize, &[u8])]) -> Vec<u8> {
        let mut image = vec![0u8; 8192];
        for (offset, bytes) in parts {
            image[*offset..*offset + bytes.len()].copy_from_slice(bytes);
        }
        image
    }

    #[test]
    fn finds_nul_terminated_names() {
        let image = image_with(&[(0x40, b"/config.json\0"), (0x180, b"/Server1.pem\0")]);
        let records: Vec<_> =
            locate_file_records(&image, &SpiffsParameters::default()).collect();

        assert_eq!(
            records,
            vec![
                FileRecord {
                    offset: 0x40,
                    name: "/config.json".into()
                },
                FileRecord {
                    offset: 0x180,
                    name: "/Server1.pem".into()
                },
            ]
        );
    }

    #[test]
    fn disallowed_byte_terminates_a_name() {
        let image = image_with(&[(0x10, b"/a/bc\0")]);
        let records: Vec<_> =
            locate_file_records(&image, &SpiffsParameters::default()).collect();

        // Both slashes start a match; neither is de-duplicated away.
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "/a");
        assert_eq!(records[1].name, "/bc");
        assert_eq!(records[1].offset, 0x12);
    }

    #[test]
    fn names_are_capped_at_the_object_name_length() {
        let long = [b"/".as_slice(), [b'x'; 64].as_slice()].concat();
        let image = image_with(&[(0x20, &long)]);

        let records: Vec<_> =
            locate_file_records(&image, &SpiffsParameters::default()).collect();

        // 32 bytes total: the slash plus 31 name characters.
        assert_eq!(records[0].name.len(), 32);
    }

    #[test]
    fn matches_outside_the_first_block_are_ignored() {
        let image = image_with(&[(0x40, b"/inside\0"), (0x1800, b"/outside\0")]);
        let records: Vec<_> =
            locate_file_records(&image, &SpiffsParameters::default()).collect();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "/inside");
    }

    #[test]
    fn lone_slash_is_not_a_record() {
        let image = image_with(&[(0x40, b"/\0"), (0x60, b"/ok\0")]);
        let records: Vec<_> =
            locate_file_records(&image, &SpiffsParameters::default()).collect();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "/ok");
    }

    #[test]
    fn scanner_is_restartable() {
        let image = image_with(&[(0x40, b"/one\0"), (0x80, b"/two\0")]);
        let scanner = locate_file_records(&image, &SpiffsParameters::default());

        let first_pass: Vec<_> = scanner.clone().collect();
        let second_pass: Vec<_> = scanner.collect();

        assert_eq!(first_pass, second_pass);
        assert_eq!(first_pass.len(), 2);
    }

    #[test]
    fn short_images_do_not_panic() {
        let image = b"/tiny";
        let records: Vec<_> =
            locate_file_records(image, &SpiffsParameters::default()).collect();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "/tiny");
    }
}
