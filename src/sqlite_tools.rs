use std::path::{Path, PathBuf};

use r2d2_sqlite::SqliteConnectionManager;

use crate::error::Result;

/// This type alias is the pool, which can be queried for connections.
/// It is cheap to clone and safe to share across query threads.
pub type KauriSqlitePool = r2d2::Pool<SqliteConnectionManager>;

/// Type alias to the pooled connection.
/// A checked-out connection must stay on a single thread.
pub type KauriConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Open (or create) the database file and build the pool.
/// Every connection enables WAL journalling before it is handed out.
pub fn make_pool(db_path: &Path) -> Result<KauriSqlitePool> {
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "OFF")?;
        Ok(())
    });

    let pool = r2d2::Pool::builder().max_size(16).build(manager)?;

    Ok(pool)
}

/// Pool over a private in-memory database, for tests and scratch work.
pub fn make_memory_pool() -> Result<KauriSqlitePool> {
    let manager = SqliteConnectionManager::memory();

    // A single connection keeps all readers on the same in-memory store.
    let pool = r2d2::Pool::builder().max_size(1).build(manager)?;

    Ok(pool)
}

/// Resolve the on-disk location for a named database:
/// `<workdir>/gtfs/gtfs-<name>.db`, creating the folder when missing.
pub fn database_path(name: &str) -> Result<PathBuf> {
    let dir = std::env::current_dir()?.join("gtfs");
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join(format!("gtfs-{name}.db")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pool_round_trips_rows() {
        let pool = make_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        conn.execute_batch("CREATE TABLE t (x TEXT); INSERT INTO t VALUES ('a');")
            .unwrap();
        let x: String = conn
            .query_row("SELECT x FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(x, "a");
    }
}
