//! Storage layer for chatvault.
//!
//! Two independent stores live here:
//!
//! - [`ProgressStore`] keeps per-conversation backfill cursors and gap lists in
//!   a single JSON snapshot file, replaced atomically on every mutation
//! - [`ArchiveIndex`] is a DuckDB table of message IDs already archived,
//!   queried read-only during gap reconciliation

mod archive_index;
mod error;
mod progress_store;
mod snapshot;

pub use archive_index::ArchiveIndex;
pub use error::{StorageError, StorageResult};
pub use progress_store::{ConversationProgress, ProgressStore};

use std::path::{Path, PathBuf};

/// Opens the archive database, capped at `memory_limit` and `threads`.
///
/// The archive writer may die mid-transaction and leave its write-ahead log
/// next to the database, which makes the next open fail. In that case the log
/// is discarded once and the open retried; the archive is an index, so a lost
/// tail only shows up as gaps for the detector to fill.
pub fn open_duckdb_with_wal_recovery(
    path: &Path,
    memory_limit: &str,
    threads: u32,
) -> StorageResult<duckdb::Connection> {
    let conn = match duckdb::Connection::open(path) {
        Ok(conn) => conn,
        Err(err) => {
            let wal = wal_path(path);
            if !wal.exists() {
                return Err(err.into());
            }
            tracing::warn!("archive open failed ({err}), discarding {}", wal.display());
            std::fs::remove_file(&wal)?;
            duckdb::Connection::open(path)?
        }
    };
    conn.execute_batch(&format!(
        "PRAGMA memory_limit='{memory_limit}'; PRAGMA threads={threads};"
    ))?;
    Ok(conn)
}

/// `archive.duckdb` -> `archive.duckdb.wal`
fn wal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".wal");
    PathBuf::from(name)
}
