//! Request store and user directory.
//!
//! The pipeline only ever reads matching request rows and, on completion,
//! flips `completed` inside a single immediate transaction. The trait seam
//! keeps the core engine-agnostic; the shipped implementation is SQLite.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::debug;

use crate::error::Result;

/// One observation request row.
#[derive(Debug, Clone)]
pub struct ObsRequest {
    pub id: i64,
    pub username: String,
    pub user_id: i64,
    pub group_id: String,
    pub observation_id: String,
    pub num_exp: i64,
    pub completed: bool,
    pub rts2_id: i64,
    pub telescope: String,
    pub instrument: String,
    pub filter_name: String,
    pub exp_time: f64,
    pub ra_hms: String,
    pub dec_dms: String,
    pub airmass: f64,
    pub object_name: String,
}

/// One user-directory row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: i64,
    pub username: String,
    pub email: String,
}

/// Completion stamp written alongside the flag.
#[derive(Debug, Clone, Copy)]
pub struct CompletionStamp {
    pub when: DateTime<Utc>,
}

impl CompletionStamp {
    pub fn now() -> Self {
        Self { when: Utc::now() }
    }

    pub fn iso(&self) -> String {
        self.when.to_rfc3339()
    }

    /// Modified Julian Date of the stamp.
    pub fn mjd(&self) -> f64 {
        self.when.timestamp() as f64 / 86_400.0 + 40_587.0
    }
}

/// Read/write contract with the observation request store.
pub trait RequestStore {
    /// All request rows matching `(group_id, observation_id)`.
    fn find_requests(&mut self, group_id: &str, observation_id: &str) -> Result<Vec<ObsRequest>>;

    /// The user-directory row for `(user_id, username)`.
    fn find_user(&mut self, user_id: i64, username: &str) -> Result<Option<UserRecord>>;

    /// Set `completed` (plus timestamp fields) on one request, as a unit.
    fn mark_completed(&mut self, request_id: i64, stamp: &CompletionStamp) -> Result<()>;
}

/// SQLite-backed request store.
pub struct SqliteRequestStore {
    conn: Connection,
}

impl SqliteRequestStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS obsreqs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                group_id TEXT NOT NULL,
                observation_id TEXT NOT NULL,
                num_exp INTEGER NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                completed_iso TEXT,
                completed_mjd REAL,
                rts2_id INTEGER NOT NULL,
                telescope TEXT NOT NULL,
                instrument TEXT NOT NULL,
                filter_name TEXT NOT NULL,
                exp_time REAL NOT NULL,
                ra_hms TEXT NOT NULL,
                dec_dms TEXT NOT NULL,
                airmass REAL NOT NULL,
                object_name TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_obsreqs_group
                ON obsreqs (group_id, observation_id);
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                username TEXT NOT NULL,
                email TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Test/ops helper: insert a request row, returning its id.
    pub fn insert_request(&mut self, req: &ObsRequest) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO obsreqs
             (username, user_id, group_id, observation_id, num_exp, completed,
              rts2_id, telescope, instrument, filter_name, exp_time, ra_hms,
              dec_dms, airmass, object_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                req.username,
                req.user_id,
                req.group_id,
                req.observation_id,
                req.num_exp,
                req.completed,
                req.rts2_id,
                req.telescope,
                req.instrument,
                req.filter_name,
                req.exp_time,
                req.ra_hms,
                req.dec_dms,
                req.airmass,
                req.object_name,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Test/ops helper: insert a user-directory row.
    pub fn insert_user(&mut self, user: &UserRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (user_id, username, email) VALUES (?1, ?2, ?3)",
            params![user.user_id, user.username, user.email],
        )?;
        Ok(())
    }
}

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<ObsRequest> {
    Ok(ObsRequest {
        id: row.get("id")?,
        username: row.get("username")?,
        user_id: row.get("user_id")?,
        group_id: row.get("group_id")?,
        observation_id: row.get("observation_id")?,
        num_exp: row.get("num_exp")?,
        completed: row.get("completed")?,
        rts2_id: row.get("rts2_id")?,
        telescope: row.get("telescope")?,
        instrument: row.get("instrument")?,
        filter_name: row.get("filter_name")?,
        exp_time: row.get("exp_time")?,
        ra_hms: row.get("ra_hms")?,
        dec_dms: row.get("dec_dms")?,
        airmass: row.get("airmass")?,
        object_name: row.get("object_name")?,
    })
}

impl RequestStore for SqliteRequestStore {
    fn find_requests(&mut self, group_id: &str, observation_id: &str) -> Result<Vec<ObsRequest>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, username, user_id, group_id, observation_id, num_exp,
                    completed, rts2_id, telescope, instrument, filter_name,
                    exp_time, ra_hms, dec_dms, airmass, object_name
             FROM obsreqs
             WHERE group_id = ?1 AND observation_id = ?2
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![group_id, observation_id], row_to_request)?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row?);
        }
        Ok(requests)
    }

    fn find_user(&mut self, user_id: i64, username: &str) -> Result<Option<UserRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT user_id, username, email FROM users
                 WHERE user_id = ?1 AND username = ?2",
                params![user_id, username],
                |row| {
                    Ok(UserRecord {
                        user_id: row.get("user_id")?,
                        username: row.get("username")?,
                        email: row.get("email")?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn mark_completed(&mut self, request_id: i64, stamp: &CompletionStamp) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE obsreqs
             SET completed = 1, completed_iso = ?1, completed_mjd = ?2
             WHERE id = ?3",
            params![stamp.iso(), stamp.mjd(), request_id],
        )?;
        // Rollback happens automatically via Drop if commit never runs.
        tx.commit()?;
        debug!("marked request {request_id} completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_request(gid: &str, oid: &str, num_exp: i64) -> ObsRequest {
        ObsRequest {
            id: 0,
            username: "astro".to_string(),
            user_id: 7,
            group_id: gid.to_string(),
            observation_id: oid.to_string(),
            num_exp,
            completed: false,
            rts2_id: 4242,
            telescope: "Kuiper".to_string(),
            instrument: "Mont4k".to_string(),
            filter_name: "V".to_string(),
            exp_time: 30.0,
            ra_hms: "03:33:36.4".to_string(),
            dec_dms: "-36:08:25".to_string(),
            airmass: 1.2,
            object_name: "NGC 1365".to_string(),
        }
    }

    #[test]
    fn finds_requests_by_group_and_observation() {
        let mut store = SqliteRequestStore::open_in_memory().expect("open");
        store.insert_request(&sample_request("g1", "o1", 3)).expect("insert");
        store.insert_request(&sample_request("g2", "o2", 5)).expect("insert");

        let found = store.find_requests("g1", "o1").expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].num_exp, 3);
        assert!(!found[0].completed);

        assert!(store.find_requests("g1", "o2").expect("query").is_empty());
    }

    #[test]
    fn mark_completed_sets_flag_and_stamps() {
        let mut store = SqliteRequestStore::open_in_memory().expect("open");
        let id = store.insert_request(&sample_request("g1", "o1", 3)).expect("insert");

        let stamp = CompletionStamp::now();
        store.mark_completed(id, &stamp).expect("update");

        let found = store.find_requests("g1", "o1").expect("query");
        assert!(found[0].completed);

        let (iso, mjd): (Option<String>, Option<f64>) = store
            .conn
            .query_row(
                "SELECT completed_iso, completed_mjd FROM obsreqs WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("stamps");
        assert_eq!(iso, Some(stamp.iso()));
        assert!(mjd.is_some());
    }

    #[test]
    fn user_directory_lookup() {
        let mut store = SqliteRequestStore::open_in_memory().expect("open");
        store
            .insert_user(&UserRecord {
                user_id: 7,
                username: "astro".to_string(),
                email: "astro@example.edu".to_string(),
            })
            .expect("insert");

        let found = store.find_user(7, "astro").expect("query");
        assert_eq!(
            found,
            Some(UserRecord {
                user_id: 7,
                username: "astro".to_string(),
                email: "astro@example.edu".to_string(),
            })
        );
        assert_eq!(store.find_user(7, "other").expect("query"), None);
    }

    #[test]
    fn mjd_matches_known_epoch() {
        // 1970-01-01T00:00:00Z is MJD 40587 by definition.
        let stamp = CompletionStamp {
            when: DateTime::from_timestamp(0, 0).expect("epoch"),
        };
        assert_eq!(stamp.mjd(), 40_587.0);
    }
}
