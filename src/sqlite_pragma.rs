//! Shared SQLite tuning for every connection the hot tier opens
//!
//! WAL lets the ingestion path keep writing while scheduled jobs read.

use rusqlite::Connection;

/// Page cache size in KiB (negative value = size in KiB for SQLite)
const CACHE_SIZE_KIB: i64 = -64_000;

/// Memory-mapped I/O window (256 MiB)
const MMAP_SIZE_BYTES: i64 = 268_435_456;

/// Apply the pragmas used by all hot-store connections
///
/// - `journal_mode = WAL` - readers never block the writer
/// - `synchronous = NORMAL` - safe with WAL, far fewer fsyncs
/// - `temp_store = MEMORY` - sort/merge scratch space in RAM
/// - `mmap_size`, `cache_size` - keep hot pages resident
/// - `wal_autocheckpoint = 1000` - bound WAL growth
/// - `busy_timeout = 5000` - wait instead of failing on a held lock
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", MMAP_SIZE_BYTES)?;
    conn.pragma_update(None, "cache_size", CACHE_SIZE_KIB)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;

    log::debug!("📊 Applied optimized SQLite pragmas (WAL, NORMAL, MEMORY)");
    Ok(())
}
