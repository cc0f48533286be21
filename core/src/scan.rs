//! Filesystem scanner for candidate exposure files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::{DnaError, Result};

/// Map of absolute file path to byte size, produced fresh each run.
pub type ScanResult = BTreeMap<PathBuf, u64>;

/// Recursively enumerate regular, non-symlink files under `root` whose
/// extension is in `extensions`, returning path -> size.
///
/// A missing root or an empty filter is an input-validation failure; the
/// caller skips the run cleanly. Files vanishing mid-walk are excluded
/// without error: the scan races instrument writes by design.
pub fn scan_exposures(root: &Path, extensions: &[&str]) -> Result<ScanResult> {
    if extensions.is_empty() {
        return Err(DnaError::invalid("empty extension filter"));
    }
    if !root.is_dir() {
        return Err(DnaError::invalid(format!(
            "scan root is not a directory: {}",
            root.display()
        )));
    }

    let mut found = ScanResult::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                // Directory entries can disappear between readdir and stat.
                debug!("skipping unreadable entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() || entry.path_is_symlink() {
            continue;
        }
        let matches_filter = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| extensions.contains(&ext));
        if !matches_filter {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => {
                trace!("found {} ({} bytes)", entry.path().display(), meta.len());
                found.insert(entry.path().to_path_buf(), meta.len());
            }
            Err(err) => {
                debug!("file vanished during scan: {}: {err}", entry.path().display());
            }
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn touch(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; len]).expect("write fixture");
        path
    }

    #[test]
    fn finds_matching_files_recursively() {
        let tmp = TempDir::new().expect("tempdir");
        let nested = tmp.path().join("object");
        fs::create_dir(&nested).expect("mkdir");
        let a = touch(tmp.path(), "a.fits", 10);
        let b = touch(&nested, "b.fits", 20);
        touch(tmp.path(), "notes.txt", 5);

        let result = scan_exposures(tmp.path(), &["fits"]).expect("scan");
        assert_eq!(result.len(), 2);
        assert_eq!(result.get(&a), Some(&10));
        assert_eq!(result.get(&b), Some(&20));
    }

    #[test]
    fn extension_match_is_exact() {
        let tmp = TempDir::new().expect("tempdir");
        touch(tmp.path(), "a.fits", 1);
        touch(tmp.path(), "b.fit", 1);
        touch(tmp.path(), "c.FITS", 1);

        let result = scan_exposures(tmp.path(), &["fits"]).expect("scan");
        assert_eq!(result.len(), 1);

        let result = scan_exposures(tmp.path(), &["fit", "fits", "FITS"]).expect("scan");
        assert_eq!(result.len(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_excluded() {
        let tmp = TempDir::new().expect("tempdir");
        let real = touch(tmp.path(), "real.fits", 4);
        std::os::unix::fs::symlink(&real, tmp.path().join("link.fits")).expect("symlink");

        let result = scan_exposures(tmp.path(), &["fits"]).expect("scan");
        assert_eq!(result.len(), 1);
        assert!(result.contains_key(&real));
    }

    #[test]
    fn missing_root_is_reported() {
        let tmp = TempDir::new().expect("tempdir");
        let gone = tmp.path().join("nope");
        assert!(scan_exposures(&gone, &["fits"]).is_err());
    }

    #[test]
    fn empty_filter_is_reported() {
        let tmp = TempDir::new().expect("tempdir");
        assert!(scan_exposures(tmp.path(), &[]).is_err());
    }
}
