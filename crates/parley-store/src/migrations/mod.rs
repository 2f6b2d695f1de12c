//! Database migration runner.
//!
//! Each schema (relay log, local cache) has a linear, ordered list of
//! migration steps. `PRAGMA user_version` records how far a given file has
//! been migrated, so re-opening is idempotent: steps at or below the
//! current version are skipped. Before any pending step runs, the database
//! file is copied aside (see [`crate::backup`]); a failed backup is logged
//! as a warning and migration proceeds.
//!
//! A file whose version is *ahead* of what this build knows is refused;
//! continuing against an unknown schema would risk a partially-migrated
//! store.

pub mod cache_v001_initial;
pub mod cache_v002_send_state;
pub mod relay_v001_initial;
pub mod relay_v002_deliveries;

use std::path::Path;

use rusqlite::Connection;

use crate::backup;
use crate::error::{Result, StoreError};

/// One schema migration step.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: fn(&Connection) -> rusqlite::Result<()>,
}

/// Server-side relay log schema, in order.
pub const RELAY_STEPS: &[Migration] = &[
    Migration {
        version: 1,
        name: "relay_v001_initial",
        up: relay_v001_initial::up,
    },
    Migration {
        version: 2,
        name: "relay_v002_deliveries",
        up: relay_v002_deliveries::up,
    },
];

/// Client-side local cache schema, in order.
pub const CACHE_STEPS: &[Migration] = &[
    Migration {
        version: 1,
        name: "cache_v001_initial",
        up: cache_v001_initial::up,
    },
    Migration {
        version: 2,
        name: "cache_v002_send_state",
        up: cache_v002_send_state::up,
    },
];

/// Run all pending migrations from `steps` against the open connection.
pub fn run(conn: &Connection, db_path: Option<&Path>, steps: &[Migration]) -> Result<()> {
    let target = steps.last().map(|m| m.version).unwrap_or(0);
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    tracing::info!(
        current_version = current,
        target_version = target,
        "checking database migrations"
    );

    if current == target {
        return Ok(());
    }

    if current > target {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than supported v{target}"
        )));
    }

    // Back up the prior file before altering the schema. Not fatal if it
    // fails: migration still proceeds rather than blocking the user.
    if let Some(path) = db_path {
        match backup::before_migration(path, current) {
            Ok(Some(backup_path)) => {
                tracing::info!(backup = %backup_path.display(), "database backed up");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "pre-migration backup failed, continuing");
            }
        }
    }

    for step in steps.iter().filter(|s| s.version > current) {
        tracing::info!(version = step.version, name = step.name, "applying migration");
        (step.up)(conn)
            .map_err(|e| StoreError::Migration(format!("{}: {e}", step.name)))?;
        conn.pragma_update(None, "user_version", step.version)?;
    }

    Ok(())
}
