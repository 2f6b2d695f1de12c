//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees
//! that migrations (including the pre-migration backup) run before any
//! other operation. The same wrapper serves the relay log and the client's
//! local cache; the two differ only in the migration set applied at open.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use directories::ProjectDirs;
use parley_shared::UserId;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the relay log in the platform data directory.
    pub fn open_relay() -> Result<Self> {
        let path = default_data_dir()?.join("relay.db");
        Self::open_relay_at(&path)
    }

    /// Open (or create) a relay log at an explicit path. Useful for tests
    /// and custom deployments.
    pub fn open_relay_at(path: &Path) -> Result<Self> {
        Self::open_with(path, migrations::RELAY_STEPS)
    }

    /// Open (or create) the local cache for one owner identity in the
    /// platform data directory. Each owner gets their own file, so the
    /// migration version recorded in it is per-owner.
    pub fn open_cache(owner: &UserId) -> Result<Self> {
        let path = default_data_dir()?.join(format!("cache-{}.db", owner));
        Self::open_cache_at(&path)
    }

    /// Open (or create) a local cache at an explicit path.
    pub fn open_cache_at(path: &Path) -> Result<Self> {
        Self::open_with(path, migrations::CACHE_STEPS)
    }

    fn open_with(path: &Path, steps: &[migrations::Migration]) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&conn, Some(path), steps)?;

        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed helpers, but direct access is
    /// occasionally needed for transactions or ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

fn default_data_dir() -> Result<PathBuf> {
    let project_dirs =
        ProjectDirs::from("org", "parley", "parley").ok_or(StoreError::NoDataDir)?;
    Ok(project_dirs.data_dir().to_path_buf())
}

/// Fixed-width RFC 3339 with millisecond precision, so that lexicographic
/// order of the stored text matches chronological order.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn ts_from_sql(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open_relay_at(&path).expect("should open");
        assert!(db.path().is_some());
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap()
            + chrono::Duration::milliseconds(50);
        let b = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap()
            + chrono::Duration::milliseconds(250);
        assert!(ts_to_sql(&a) < ts_to_sql(&b));
        assert_eq!(ts_from_sql(&ts_to_sql(&a)).unwrap(), a);
    }
}
