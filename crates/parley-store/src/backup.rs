//! Pre-migration file backups.
//!
//! Before a database file is migrated, a copy named
//! `<file>.v<version>-<unix-ts>.bak` is placed next to it. Only the
//! newest [`KEEP_BACKUPS`] copies per database are kept, so repeated
//! upgrades cannot grow disk usage without bound.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// How many prior backups to keep per database file.
pub const KEEP_BACKUPS: usize = 3;

/// Copy `db_path` aside before migrating it away from `from_version`.
///
/// Returns `Ok(None)` when there is nothing to back up (the file does not
/// exist yet, i.e. a fresh database).
pub fn before_migration(db_path: &Path, from_version: u32) -> io::Result<Option<PathBuf>> {
    if !db_path.exists() {
        return Ok(None);
    }

    let file_name = db_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unnamed database file"))?;

    let backup_name = format!(
        "{file_name}.v{from_version:03}-{}.bak",
        chrono::Utc::now().timestamp_millis()
    );
    let backup_path = db_path.with_file_name(&backup_name);

    std::fs::copy(db_path, &backup_path)?;
    debug!(backup = %backup_path.display(), "created pre-migration backup");

    prune_old_backups(db_path, file_name)?;

    Ok(Some(backup_path))
}

/// Delete all but the newest [`KEEP_BACKUPS`] backups of `file_name`.
fn prune_old_backups(db_path: &Path, file_name: &str) -> io::Result<()> {
    let dir = match db_path.parent() {
        Some(d) if d.as_os_str().is_empty() => Path::new("."),
        Some(d) => d,
        None => Path::new("."),
    };

    let prefix = format!("{file_name}.v");
    let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".bak"))
        })
        .collect();

    // Backup names embed a millisecond timestamp, so name order is age order.
    backups.sort();

    while backups.len() > KEEP_BACKUPS {
        let oldest = backups.remove(0);
        debug!(path = %oldest.display(), "pruning old backup");
        std::fs::remove_file(oldest)?;
    }

    Ok(())
}
