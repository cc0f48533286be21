//! Batch reconciliation engine for observatory exposure data.
//!
//! Scans a night's data directory for new exposure files, matches them to
//! pending observation requests, detects satisfied requests, bundles their
//! files, and notifies the owners. Designed for re-entrant batch execution:
//! the ledger makes re-runs idempotent, and archive existence plus the
//! completed flag keep bundling and notification at-most-once.
//!
//! The crate emits through `tracing` and never installs a subscriber; the
//! binary owns logging configuration.

pub mod archive;
pub mod config;
pub mod error;
pub mod fits;
pub mod group;
pub mod identity;
pub mod ledger;
pub mod notify;
pub mod pipeline;
pub mod scan;
pub mod store;

pub use config::{Instrument, ObservingNight, SiteConfig, Telescope};
pub use error::{DnaError, Result};
pub use identity::{FitsHeaderReader, HeaderReader};
pub use ledger::Ledger;
pub use notify::{MailTransport, NotificationFilter, Notifier, SmtpConfig, SmtpTransport};
pub use pipeline::{Pipeline, RunSummary};
pub use store::{RequestStore, SqliteRequestStore};
