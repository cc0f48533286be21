//! Bundling of completed groups into compressed archives.
//!
//! Bundle names are deterministic, and existence on disk is the
//! already-archived marker: creation is skipped when the bundle is present,
//! and a failed creation removes the partial file so the next run retries.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use tar::Builder;
use tracing::{info, warn};

use crate::config::{CALIBRATION_CATEGORIES, Instrument, ObservingNight, SiteConfig, Telescope};
use crate::error::{DnaError, Result};

/// Ownership applied to created bundles so the serving process can read
/// them (`www-data` on the production hosts).
#[derive(Debug, Clone, Copy)]
pub struct ArchivePolicy {
    pub uid: u32,
    pub gid: u32,
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        Self { uid: 33, gid: 33 }
    }
}

/// Deterministic bundle path for a completed group.
pub fn bundle_path(
    config: &SiteConfig,
    night: &ObservingNight,
    username: &str,
    rts2_id: i64,
) -> PathBuf {
    config.archive_dir.join(format!(
        "{}.{}.{}.{}.{}.tgz",
        config.telescope, config.instrument, night, username, rts2_id
    ))
}

/// Sibling calibration bundles on disk for the same night, as
/// (category label, path) pairs. Includes the two legacy bundle names kept
/// for older serving links.
pub fn calibration_bundles(
    archive_dir: &Path,
    telescope: Telescope,
    instrument: Instrument,
    night: &ObservingNight,
) -> Vec<(String, PathBuf)> {
    let mut bundles: Vec<(String, PathBuf)> = CALIBRATION_CATEGORIES
        .iter()
        .map(|category| {
            (
                (*category).to_string(),
                archive_dir.join(format!("{telescope}.{instrument}.{night}.{category}.tgz")),
            )
        })
        .collect();
    bundles.push(("darks".to_string(), archive_dir.join(format!("darks.{night}.tgz"))));
    bundles.push((
        "skyflats".to_string(),
        archive_dir.join(format!("skyflats.{night}.tgz")),
    ));
    bundles.retain(|(_, path)| path.exists());
    bundles
}

/// Create `dest` containing every file in `files`, unless it already
/// exists. Returns `true` when a bundle was created this call.
///
/// On any creation failure the partial bundle is removed, keeping the
/// existence check honest for the retry on the next run.
pub fn create_bundle(dest: &Path, files: &[PathBuf], policy: ArchivePolicy) -> Result<bool> {
    if dest.exists() {
        info!("bundle {} already exists, skipping", dest.display());
        return Ok(false);
    }
    if files.is_empty() {
        return Err(DnaError::Archive(format!(
            "refusing to create empty bundle {}",
            dest.display()
        )));
    }

    match write_bundle(dest, files) {
        Ok(()) => {}
        Err(err) => {
            if let Err(cleanup) = fs::remove_file(dest) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not remove partial bundle {}: {cleanup}", dest.display());
                }
            }
            return Err(err);
        }
    }

    apply_ownership(dest, policy);
    info!("created bundle {} with {} files", dest.display(), files.len());
    Ok(true)
}

fn write_bundle(dest: &Path, files: &[PathBuf]) -> Result<()> {
    let file = File::create(dest)
        .map_err(|err| DnaError::Archive(format!("cannot create {}: {err}", dest.display())))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);

    for path in files {
        let name = path
            .file_name()
            .ok_or_else(|| DnaError::Archive(format!("unnamed file {}", path.display())))?;
        builder
            .append_path_with_name(path, name)
            .map_err(|err| DnaError::Archive(format!("cannot add {}: {err}", path.display())))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|err| DnaError::Archive(format!("cannot finish {}: {err}", dest.display())))?;
    encoder
        .finish()
        .map_err(|err| DnaError::Archive(format!("cannot flush {}: {err}", dest.display())))?;
    Ok(())
}

#[cfg(unix)]
fn apply_ownership(dest: &Path, policy: ArchivePolicy) {
    if let Err(err) = std::os::unix::fs::chown(dest, Some(policy.uid), Some(policy.gid)) {
        // Not fatal: the bundle exists and the serving process may still
        // read it via group/other permissions.
        warn!("could not chown {}: {err}", dest.display());
    }
}

#[cfg(not(unix))]
fn apply_ownership(_dest: &Path, _policy: ArchivePolicy) {}
