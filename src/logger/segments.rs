//! Segment file discovery and naming (spec §4.6 "Segment filename pattern:
//! `log<12-digit-decimal>.<extension>`; decimal increases monotonically;
//! recovery sorts by decimal"). Grounded on `original_source/newbrt/log.c`'s
//! `toku_logger_find_next_unused_log_file`, which scans a directory for
//! `log%012llu.<ext>` entries and returns one past the highest it finds.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Build the path for segment number `n` inside `directory`.
pub fn segment_path(directory: &Path, extension: &str, n: u64) -> PathBuf {
    directory.join(format!("log{:012}.{}", n, extension))
}

/// Parse a directory entry's file name back into a segment number, if it
/// matches `log<12 digits>.<extension>` exactly.
fn parse_segment_number(file_name: &str, extension: &str) -> Option<u64> {
    let suffix = format!(".{}", extension);
    let stem = file_name.strip_suffix(&suffix)?;
    let digits = stem.strip_prefix("log")?;
    if digits.len() != 12 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Every existing segment number in `directory`, ascending (spec §4.6
/// "recovery sorts by decimal").
pub fn existing_segments(directory: &Path, extension: &str) -> Result<Vec<u64>> {
    let mut found = Vec::new();
    if !directory.exists() {
        return Ok(found);
    }
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(n) = parse_segment_number(name, extension) {
                found.push(n);
            }
        }
    }
    found.sort_unstable();
    Ok(found)
}

/// One past the highest existing segment number, or 0 if the directory is
/// empty or missing (spec §4.6, `toku_logger_find_next_unused_log_file`).
pub fn next_unused_segment(directory: &Path, extension: &str) -> Result<u64> {
    Ok(existing_segments(directory, extension)?
        .last()
        .map(|n| n + 1)
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_names_only() {
        assert_eq!(parse_segment_number("log000000000003.tokulog", "tokulog"), Some(3));
        assert_eq!(parse_segment_number("log3.tokulog", "tokulog"), None);
        assert_eq!(parse_segment_number("log000000000003.tokulog", "other"), None);
        assert_eq!(parse_segment_number("notalog000000000003.tokulog", "tokulog"), None);
    }

    #[test]
    fn next_unused_on_empty_directory_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_unused_segment(dir.path(), "tokulog").unwrap(), 0);
    }

    #[test]
    fn next_unused_follows_highest_existing() {
        let dir = tempfile::tempdir().unwrap();
        for n in [0u64, 1, 2, 5] {
            fs::write(segment_path(dir.path(), "tokulog", n), b"x").unwrap();
        }
        assert_eq!(next_unused_segment(dir.path(), "tokulog").unwrap(), 6);
        let segs = existing_segments(dir.path(), "tokulog").unwrap();
        assert_eq!(segs, vec![0, 1, 2, 5]);
    }
}
