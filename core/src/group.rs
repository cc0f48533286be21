//! Grouping engine: accumulates files into observation groups.
//!
//! Rebuilt each run by merging ledger history with newly classified files.
//! List order is discovery order, historical entries first. Path-keyed
//! dedup lives in the ledger, so a file counted once is never counted
//! again.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::ledger::Ledger;

/// Transient per-run accumulator: group id -> ordered file list.
#[derive(Debug, Default)]
pub struct GroupAccumulator {
    groups: HashMap<String, Vec<PathBuf>>,
    /// Groups that received a new file this run, with the observation id
    /// that accompanied it. Ordered for deterministic detection.
    touched: BTreeMap<String, String>,
}

impl GroupAccumulator {
    /// Seed the accumulator with every prior entry in the ledger.
    pub fn from_ledger(ledger: &Ledger) -> Self {
        let mut acc = Self::default();
        for entry in ledger.entries() {
            acc.groups
                .entry(entry.group_id.clone())
                .or_default()
                .push(entry.file.clone());
        }
        acc
    }

    /// Record a newly classified file, marking its group as touched.
    pub fn record_new(&mut self, group_id: &str, observation_id: &str, file: &Path) {
        self.groups
            .entry(group_id.to_string())
            .or_default()
            .push(file.to_path_buf());
        self.mark_touched(group_id, observation_id);
    }

    /// Mark a group as touched without adding a file. Used when a scanned
    /// file is already ledgered: its presence keeps an unfinished group
    /// (failed commit, failed archive) eligible for detection.
    pub fn mark_touched(&mut self, group_id: &str, observation_id: &str) {
        self.touched
            .entry(group_id.to_string())
            .or_insert_with(|| observation_id.to_string());
    }

    /// Complete ordered file list ever seen for `group_id`.
    pub fn files(&self, group_id: &str) -> &[PathBuf] {
        self.groups.get(group_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Groups touched this run, in deterministic order, with their
    /// observation ids.
    pub fn touched(&self) -> impl Iterator<Item = (&str, &str)> {
        self.touched
            .iter()
            .map(|(gid, oid)| (gid.as_str(), oid.as_str()))
    }

    pub fn touched_len(&self) -> usize {
        self.touched.len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use crate::ledger::LedgerEntry;

    use super::*;

    fn entry(file: &str, gid: &str) -> LedgerEntry {
        LedgerEntry {
            file: PathBuf::from(file),
            user: String::new(),
            email: String::new(),
            group_id: gid.to_string(),
            observation_id: format!("{gid}-oid"),
            target: "x".to_string(),
            size: 2880,
            timestamp: "2026-08-06T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn historical_files_precede_new_ones() {
        let tmp = TempDir::new().expect("tempdir");
        let mut ledger = Ledger::load(&tmp.path().join("ledger.json"));
        ledger.append(entry("/d/object/old.fits", "g1")).expect("append");

        let mut acc = GroupAccumulator::from_ledger(&ledger);
        acc.record_new("g1", "g1-oid", Path::new("/d/object/new.fits"));

        assert_eq!(
            acc.files("g1"),
            &[
                PathBuf::from("/d/object/old.fits"),
                PathBuf::from("/d/object/new.fits"),
            ]
        );
    }

    #[test]
    fn seeding_from_ledger_does_not_touch_groups() {
        let tmp = TempDir::new().expect("tempdir");
        let mut ledger = Ledger::load(&tmp.path().join("ledger.json"));
        ledger.append(entry("/d/object/old.fits", "g1")).expect("append");

        let mut acc = GroupAccumulator::from_ledger(&ledger);
        acc.record_new("g2", "g2-oid", Path::new("/d/object/new.fits"));

        let touched: Vec<(&str, &str)> = acc.touched().collect();
        assert_eq!(touched, vec![("g2", "g2-oid")]);
    }

    #[test]
    fn mark_touched_adds_no_files() {
        let tmp = TempDir::new().expect("tempdir");
        let mut ledger = Ledger::load(&tmp.path().join("ledger.json"));
        ledger.append(entry("/d/object/old.fits", "g1")).expect("append");

        let mut acc = GroupAccumulator::from_ledger(&ledger);
        acc.mark_touched("g1", "g1-oid");

        let touched: Vec<(&str, &str)> = acc.touched().collect();
        assert_eq!(touched, vec![("g1", "g1-oid")]);
        assert_eq!(acc.files("g1").len(), 1);
    }

    #[test]
    fn touched_order_is_deterministic() {
        let mut acc = GroupAccumulator::default();
        acc.record_new("zeta", "z-oid", Path::new("/d/object/z.fits"));
        acc.record_new("alpha", "a-oid", Path::new("/d/object/a.fits"));
        acc.record_new("zeta", "z-oid", Path::new("/d/object/z2.fits"));

        let touched: Vec<(&str, &str)> = acc.touched().collect();
        assert_eq!(touched, vec![("alpha", "a-oid"), ("zeta", "z-oid")]);
        assert_eq!(acc.files("zeta").len(), 2);
    }

    #[test]
    fn unknown_group_has_no_files() {
        let acc = GroupAccumulator::default();
        assert!(acc.files("missing").is_empty());
    }
}
