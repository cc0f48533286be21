//! `dna` command-line surface: flag parsing, logging setup, collaborator
//! construction, and one pipeline invocation.
//!
//! Input-validation failures (bad date, unsupported telescope/instrument
//! combination, missing data directory) abort the run early and are logged,
//! not surfaced as process failure: the periodic wrapper should keep
//! scheduling runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dna_core::archive::ArchivePolicy;
use dna_core::{
    DnaError, FitsHeaderReader, Instrument, NotificationFilter, Notifier, ObservingNight,
    Pipeline, RunSummary, SiteConfig, SmtpConfig, SmtpTransport, SqliteRequestStore, Telescope,
};

#[derive(Debug, Parser)]
#[command(name = "dna", about = "Observatory data notification agent", version)]
pub struct Cli {
    /// Data directory to scan; defaults to the night's object directory
    #[arg(long = "data")]
    data: Option<PathBuf>,

    /// Instrument that produced the exposures
    #[arg(long = "instrument", default_value = "Mont4k")]
    instrument: String,

    /// ISO date partition <yyyymmdd>; defaults to today
    #[arg(long = "iso")]
    iso: Option<String>,

    /// Ledger JSON file; defaults to .dna.json beside the data directory
    #[arg(long = "ledger")]
    ledger: Option<PathBuf>,

    /// Only notify for target names containing this substring
    #[arg(long = "object", default_value = "")]
    object: String,

    /// Telescope the instrument is mounted on
    #[arg(long = "telescope", default_value = "Kuiper")]
    telescope: String,

    /// Only notify recipient addresses containing this substring
    #[arg(long = "user", default_value = "")]
    user: String,

    /// Send completion notifications (archival and ledger work happen
    /// either way)
    #[arg(long = "mail")]
    mail: bool,

    /// Bundle output directory; defaults to the site archive directory
    #[arg(long = "archive-dir")]
    archive_dir: Option<PathBuf>,

    /// SQLite request store
    #[arg(long = "database", default_value = "obsreq.db")]
    database: PathBuf,

    /// Log level used when RUST_LOG is unset
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn default_iso() -> String {
        chrono::Local::now().format("%Y%m%d").to_string()
    }

    fn data_dir(&self, telescope: Telescope, instrument: Instrument, iso: &str) -> PathBuf {
        self.data.clone().unwrap_or_else(|| {
            PathBuf::from(format!("/rts2data/{telescope}/{instrument}/{iso}/object"))
        })
    }

    fn ledger_path(&self, data_dir: &Path) -> PathBuf {
        self.ledger.clone().unwrap_or_else(|| {
            data_dir
                .parent()
                .map(|night_dir| night_dir.join(".dna.json"))
                .unwrap_or_else(|| data_dir.join(".dna.json"))
        })
    }
}

/// Parse arguments, configure logging, and run one reconciliation cycle.
pub fn run_main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match execute(&cli) {
        Ok(summary) => {
            info!("dna run complete: {summary}");
            Ok(())
        }
        Err(DnaError::InvalidInput(message)) => {
            // Reported, not fatal: the run is skipped cleanly.
            error!("run skipped: {message}");
            Ok(())
        }
        Err(err) => Err(err).context("dna run failed"),
    }
}

fn execute(cli: &Cli) -> dna_core::Result<RunSummary> {
    let telescope: Telescope = cli.telescope.parse()?;
    let instrument: Instrument = cli.instrument.parse()?;
    let mut config = SiteConfig::new(telescope, instrument)?;
    if let Some(archive_dir) = &cli.archive_dir {
        config.archive_dir = archive_dir.clone();
    }

    let iso = cli.iso.clone().unwrap_or_else(Cli::default_iso);
    let night = ObservingNight::parse(&iso)?;

    let data_dir = cli.data_dir(telescope, instrument, night.as_str());
    let ledger_path = cli.ledger_path(&data_dir);

    let mut store = SqliteRequestStore::open(&cli.database)?;

    let mut transport = if cli.mail {
        match SmtpConfig::from_env() {
            Some(smtp) => match SmtpTransport::connect(&smtp) {
                Ok(transport) => Some((transport, smtp.username)),
                Err(err) => {
                    // Mail stays best-effort: archival and the ledger must
                    // not wait on a broken relay.
                    error!("cannot open mail transport: {err}");
                    None
                }
            },
            None => {
                warn!("--mail given but MAIL_SERVER/MAIL_USERNAME are unset");
                None
            }
        }
    } else {
        None
    };

    let pipeline = Pipeline {
        config: &config,
        night: &night,
        data_dir: &data_dir,
        ledger_path: &ledger_path,
        archive_policy: ArchivePolicy::default(),
    };

    let notification_filter = NotificationFilter::new(
        Some(cli.user.clone()),
        Some(cli.object.clone()),
    );
    let summary = match transport.as_mut() {
        Some((transport, from)) => {
            let mut notifier =
                Notifier::new(transport, from.clone(), notification_filter);
            pipeline.run(&mut store, &FitsHeaderReader, Some(&mut notifier))?
        }
        None => pipeline.run(&mut store, &FitsHeaderReader, None)?,
    };

    if let Some((mut transport, _)) = transport {
        transport.quit();
    }
    Ok(summary)
}
