//! Site configuration: telescope/instrument support table, valid exposure
//! sizes, archive layout, and the observing-night date partition.
//!
//! The support table is enumerated and validated before any file processing
//! begins; an unsupported telescope/instrument combination aborts the run.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{DnaError, Result};

/// Exposure file extensions recognized by the scanner.
pub const EXPOSURE_EXTENSIONS: &[&str] = &["fit", "fits", "FIT", "FITS"];

/// Known-valid Mont4k exposure byte sizes (full frames, binned frames and
/// calibration products). Anything else is a truncated or corrupt readout.
const MONT4K_SIZES: &[u64] = &[
    2880, 11520, 14400, 20480, 49152, 57600, 256000, 358400, 432128, 655360, 2206080, 3841920,
    3856320, 3859200, 3862080, 3864960, 3867840, 7704000, 14904000, 14906880, 14921280,
];

/// Calibration bundle categories probed when composing notification links.
pub const CALIBRATION_CATEGORIES: &[&str] = &[
    "bias",
    "calibration",
    "dark",
    "flat",
    "focus",
    "skyflat",
    "standard",
];

/// Supported telescopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Telescope {
    Bok,
    Kuiper,
    Mmt,
    Vatt,
}

impl Telescope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bok => "Bok",
            Self::Kuiper => "Kuiper",
            Self::Mmt => "MMT",
            Self::Vatt => "Vatt",
        }
    }

    /// Instruments mounted on this telescope.
    pub fn instruments(&self) -> &'static [Instrument] {
        match self {
            Self::Bok => &[Instrument::NinetyPrime, Instrument::BcSpec],
            Self::Kuiper => &[Instrument::Mont4k],
            Self::Mmt => &[Instrument::BinoSpec],
            Self::Vatt => &[Instrument::Vatt4k],
        }
    }
}

impl FromStr for Telescope {
    type Err = DnaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bok" => Ok(Self::Bok),
            "kuiper" => Ok(Self::Kuiper),
            "mmt" => Ok(Self::Mmt),
            "vatt" => Ok(Self::Vatt),
            _ => Err(DnaError::invalid(format!("unknown telescope: {s}"))),
        }
    }
}

impl fmt::Display for Telescope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instrument {
    NinetyPrime,
    BcSpec,
    Mont4k,
    BinoSpec,
    Vatt4k,
}

impl Instrument {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NinetyPrime => "90Prime",
            Self::BcSpec => "BCSpec",
            Self::Mont4k => "Mont4k",
            Self::BinoSpec => "BinoSpec",
            Self::Vatt4k => "Vatt4k",
        }
    }

    /// Known-valid exposure byte sizes for this instrument, if a table
    /// exists. Instruments without a table accept any size.
    pub fn valid_sizes(&self) -> Option<&'static [u64]> {
        match self {
            Self::Mont4k => Some(MONT4K_SIZES),
            _ => None,
        }
    }
}

impl FromStr for Instrument {
    type Err = DnaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "90prime" => Ok(Self::NinetyPrime),
            "bcspec" => Ok(Self::BcSpec),
            "mont4k" => Ok(Self::Mont4k),
            "binospec" => Ok(Self::BinoSpec),
            "vatt4k" => Ok(Self::Vatt4k),
            _ => Err(DnaError::invalid(format!("unknown instrument: {s}"))),
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observing night, the `yyyymmdd` date partition of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservingNight(String);

impl ObservingNight {
    /// Parse an 8-digit `yyyymmdd` string, rejecting impossible dates.
    pub fn parse(iso: &str) -> Result<Self> {
        if iso.len() != 8 || !iso.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DnaError::invalid(format!("ISO date must be yyyymmdd: {iso}")));
        }
        NaiveDate::parse_from_str(iso, "%Y%m%d")
            .map_err(|_| DnaError::invalid(format!("not a calendar date: {iso}")))?;
        Ok(Self(iso.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObservingNight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated site configuration for one run.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub telescope: Telescope,
    pub instrument: Instrument,
    /// Directory completed bundles are written to.
    pub archive_dir: PathBuf,
    /// URL base under which the serving process exposes bundles.
    pub archive_url_base: String,
    /// Identity attached to calibration frames in the ledger.
    pub operator_user: String,
    pub operator_email: String,
}

impl SiteConfig {
    /// Build a configuration, rejecting telescope/instrument combinations
    /// that are not in the support table.
    pub fn new(telescope: Telescope, instrument: Instrument) -> Result<Self> {
        if !telescope.instruments().contains(&instrument) {
            return Err(DnaError::invalid(format!(
                "instrument {instrument} is not mounted on telescope {telescope}"
            )));
        }
        Ok(Self {
            telescope,
            instrument,
            archive_dir: PathBuf::from("/var/www/ARTN-ORP/instance/files"),
            archive_url_base: "https://scopenet.as.arizona.edu/orp/files".to_string(),
            operator_user: "rts2".to_string(),
            operator_email: "rts2.operator@gmail.com".to_string(),
        })
    }

    /// True when `size` is a plausible exposure for the configured
    /// instrument.
    pub fn size_is_valid(&self, size: u64) -> bool {
        match self.instrument.valid_sizes() {
            Some(sizes) => sizes.contains(&size),
            None => true,
        }
    }
}
