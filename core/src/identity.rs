//! Identity extraction: deriving a (group id, observation id, target)
//! triple for every exposure file.
//!
//! Object frames carry their identity in the FITS primary header. Frames in
//! a calibration directory (bias, dark, flat, ...) have no request behind
//! them, so a deterministic identity is synthesized from the filename and
//! the directory category becomes the target.

use std::path::Path;

use tracing::debug;

use crate::config::SiteConfig;
use crate::error::{DnaError, Result};
use crate::fits;

/// Header keyword carrying the group id.
const KEY_GROUP_ID: &str = "ARTNGID";
/// Header keyword carrying the observation id.
const KEY_OBSERVATION_ID: &str = "ARTNOID";
/// Header keyword carrying the target name.
const KEY_TARGET: &str = "TARGET";

/// Identity triple tying a file to its logical observation group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub group_id: String,
    pub observation_id: String,
    pub target: String,
}

/// What kind of frame a file is, judged by its parent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameClass {
    /// A genuine object observation; identity comes from the header.
    Object,
    /// A calibration product (the category is the directory name);
    /// identity is synthesized from the filename.
    Calibration(String),
}

impl FrameClass {
    /// Classify by the name of the file's parent directory.
    pub fn from_path(path: &Path) -> Self {
        let category = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if category == "object" {
            Self::Object
        } else {
            Self::Calibration(category)
        }
    }
}

/// Collaborator seam for reading identity fields out of a file header.
pub trait HeaderReader {
    /// The (group id, observation id, target) triple embedded in `path`,
    /// or an error for malformed/missing headers.
    fn observation_ids(&self, path: &Path) -> Result<FileIdentity>;
}

/// `HeaderReader` over the FITS primary header.
#[derive(Debug, Default)]
pub struct FitsHeaderReader;

impl HeaderReader for FitsHeaderReader {
    fn observation_ids(&self, path: &Path) -> Result<FileIdentity> {
        let header = fits::read_primary_header(path)?;
        let field = |keyword: &str| header.get(keyword).unwrap_or_default().to_string();
        Ok(FileIdentity {
            group_id: field(KEY_GROUP_ID),
            observation_id: field(KEY_OBSERVATION_ID),
            target: field(KEY_TARGET),
        })
    }
}

/// A file that passed classification, ready for grouping and ledgering.
#[derive(Debug, Clone)]
pub struct Classified {
    pub identity: FileIdentity,
    /// Owner placeholders; object frames are resolved against the request
    /// store later, calibration frames belong to the operator.
    pub user: String,
    pub email: String,
}

/// Derive the identity for `path`, validating object frames against the
/// header and the instrument's size table.
///
/// Failures leave the file out of the ledger; it is retried next run.
pub fn classify(
    path: &Path,
    size: u64,
    config: &SiteConfig,
    reader: &dyn HeaderReader,
) -> Result<Classified> {
    match FrameClass::from_path(path) {
        FrameClass::Object => {
            let identity = reader.observation_ids(path)?;
            if identity.group_id.trim().is_empty() || identity.observation_id.trim().is_empty() {
                return Err(DnaError::invalid(format!(
                    "missing identity headers in {}",
                    path.display()
                )));
            }
            if !config.size_is_valid(size) {
                return Err(DnaError::invalid(format!(
                    "size {size} not valid for {} in {}",
                    config.instrument,
                    path.display()
                )));
            }
            Ok(Classified {
                identity,
                user: String::new(),
                email: String::new(),
            })
        }
        FrameClass::Calibration(category) => {
            debug!("synthesizing identity for {} ({category})", path.display());
            let stem = synthesized_stem(path);
            Ok(Classified {
                identity: FileIdentity {
                    group_id: format!("{stem}gid"),
                    observation_id: format!("{stem}oid"),
                    target: category,
                },
                user: config.operator_user.clone(),
                email: config.operator_email.clone(),
            })
        }
    }
}

/// Filename with `-` and `.` stripped, lower-cased. Deterministic, so the
/// same calibration file always lands in the same group.
fn synthesized_stem(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .chars()
        .filter(|c| *c != '-' && *c != '.')
        .collect::<String>()
        .to_ascii_lowercase()
}
