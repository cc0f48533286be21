//! The reconciliation pipeline: one scan → classify → group → detect →
//! archive → complete → notify → persist cycle.
//!
//! Single-threaded, blocking, run-to-completion. Concurrent runs over the
//! same ledger file and archive directory are not safe; the operational
//! wrapper serializes invocations. Every failure mode is shaped so a
//! re-run over the same inputs converges instead of duplicating work:
//! files that fail classification stay out of the ledger and are retried,
//! a group whose store commit fails is retried against the already-created
//! bundle, and completed requests are never re-evaluated.

use std::fmt;
use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::archive::{ArchivePolicy, bundle_path, calibration_bundles, create_bundle};
use crate::config::{EXPOSURE_EXTENSIONS, ObservingNight, SiteConfig};
use crate::error::Result;
use crate::group::GroupAccumulator;
use crate::identity::{HeaderReader, classify};
use crate::ledger::{Ledger, LedgerEntry, file_timestamp};
use crate::notify::Notifier;
use crate::scan::scan_exposures;
use crate::store::{CompletionStamp, RequestStore};

/// Counters reported by one pipeline run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub files_found: usize,
    pub already_processed: usize,
    pub files_skipped: usize,
    pub files_ledgered: usize,
    pub groups_touched: usize,
    pub orphans: usize,
    pub groups_completed: usize,
    pub bundles_created: usize,
    pub notifications_sent: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "found={} known={} skipped={} ledgered={} touched={} orphans={} \
             completed={} bundled={} notified={}",
            self.files_found,
            self.already_processed,
            self.files_skipped,
            self.files_ledgered,
            self.groups_touched,
            self.orphans,
            self.groups_completed,
            self.bundles_created,
            self.notifications_sent,
        )
    }
}

/// One batch reconciliation run over a data directory.
pub struct Pipeline<'a> {
    pub config: &'a SiteConfig,
    pub night: &'a ObservingNight,
    pub data_dir: &'a Path,
    pub ledger_path: &'a Path,
    pub archive_policy: ArchivePolicy,
}

impl Pipeline<'_> {
    /// Execute the full cycle and persist the ledger.
    ///
    /// `notifier` is `None` when mail is disabled: archival and ledger
    /// work still proceed, nothing is sent.
    pub fn run(
        &self,
        store: &mut dyn RequestStore,
        header_reader: &dyn HeaderReader,
        mut notifier: Option<&mut Notifier<'_>>,
    ) -> Result<RunSummary> {
        info!(
            "reconciling {} for {} night {}",
            self.data_dir.display(),
            self.config.instrument,
            self.night
        );

        let mut summary = RunSummary::default();
        let scan = scan_exposures(self.data_dir, EXPOSURE_EXTENSIONS)?;
        summary.files_found = scan.len();
        info!("found {} files for processing", scan.len());

        let mut ledger = Ledger::load(self.ledger_path);
        let mut groups = GroupAccumulator::from_ledger(&ledger);

        // Classify and ledger everything new.
        for (file, size) in &scan {
            if let Some(entry) = ledger.entry_for(file) {
                debug!("already processed {}", file.display());
                summary.already_processed += 1;
                // Presence keeps the group eligible for detection, so a
                // group whose completion commit or archival failed last
                // run is retried without rescanning its raw files.
                groups.mark_touched(&entry.group_id, &entry.observation_id);
                continue;
            }
            let classified = match classify(file, *size, self.config, header_reader) {
                Ok(classified) => classified,
                Err(err) => {
                    // Left out of the ledger on purpose: eligible for
                    // retry once the file is rewritten or replaced.
                    warn!("skipping {}: {err}", file.display());
                    summary.files_skipped += 1;
                    continue;
                }
            };
            groups.record_new(
                &classified.identity.group_id,
                &classified.identity.observation_id,
                file,
            );
            let entry = LedgerEntry {
                file: file.clone(),
                user: classified.user,
                email: classified.email,
                group_id: classified.identity.group_id,
                observation_id: classified.identity.observation_id,
                target: classified.identity.target,
                size: *size,
                timestamp: file_timestamp(file),
            };
            if let Err(err) = ledger.append(entry) {
                warn!("could not ledger {}: {err}", file.display());
                continue;
            }
            summary.files_ledgered += 1;
        }
        summary.groups_touched = groups.touched_len();

        // Detect completions on every group touched this run.
        for (group_id, observation_id) in groups.touched() {
            let files = groups.files(group_id);
            let requests = match store.find_requests(group_id, observation_id) {
                Ok(requests) => requests,
                Err(err) => {
                    warn!("request query failed for group {group_id}: {err}");
                    continue;
                }
            };
            if requests.is_empty() {
                // Orphan: the request row does not exist (yet). Files stay
                // ledgered so they are not rescanned; nothing else fires.
                debug!("no request matches group {group_id}, holding as orphan");
                summary.orphans += 1;
                continue;
            }

            for req in &requests {
                if req.completed {
                    debug!("request {} already completed, skipping", req.id);
                    continue;
                }
                let have = files.len() as i64;
                if have < req.num_exp {
                    debug!(
                        "group {group_id} has {have}/{} exposures, not complete",
                        req.num_exp
                    );
                    continue;
                }
                if have > req.num_exp {
                    warn!(
                        "group {group_id} has {have} exposures, expected {}; completing anyway",
                        req.num_exp
                    );
                }

                let user = match store.find_user(req.user_id, &req.username) {
                    Ok(Some(user)) => user,
                    Ok(None) => {
                        error!("no user directory entry for {} ({})", req.username, req.user_id);
                        continue;
                    }
                    Err(err) => {
                        error!("user query failed for {}: {err}", req.username);
                        continue;
                    }
                };

                // Archive gates completion: a bundle must exist before the
                // completed flag commits, so a commit failure retries
                // against the existence check instead of re-bundling.
                let bundle = bundle_path(self.config, self.night, &req.username, req.rts2_id);
                let created = match create_bundle(&bundle, files, self.archive_policy) {
                    Ok(created) => created,
                    Err(err) => {
                        error!("archival failed for group {group_id}: {err}");
                        continue;
                    }
                };
                if created {
                    summary.bundles_created += 1;
                }

                let stamp = CompletionStamp::now();
                if let Err(err) = store.mark_completed(req.id, &stamp) {
                    error!("completion commit failed for request {}: {err}", req.id);
                    continue;
                }
                summary.groups_completed += 1;
                info!(
                    "group {group_id} completed: {have} exposures for {} ({})",
                    req.object_name, req.username
                );
                ledger.assign_owner(files, &req.username, &user.email);

                if let Some(notifier) = notifier.as_deref_mut() {
                    let calibrations = calibration_bundles(
                        &self.config.archive_dir,
                        self.config.telescope,
                        self.config.instrument,
                        self.night,
                    );
                    match notifier.notify(
                        req,
                        &user.email,
                        &bundle,
                        &calibrations,
                        &self.config.archive_url_base,
                    ) {
                        Ok(true) => summary.notifications_sent += 1,
                        Ok(false) => {}
                        // A failed send is terminal for this completion:
                        // the flag is already committed and will not fire
                        // again.
                        Err(err) => error!("notification failed for group {group_id}: {err}"),
                    }
                }
            }
        }

        ledger.persist()?;
        info!("run finished: {summary}");
        Ok(summary)
    }
}
