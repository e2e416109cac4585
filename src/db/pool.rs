use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Connection pool for the central registry database.
///
/// One writer behind a mutex, a small set of readers picked round-robin.
/// WAL keeps readers from blocking the writer. Per-tenant databases are
/// NOT served from here — they go through the connection router.
pub struct DbPool {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
}

fn apply_pragmas(conn: &Connection, writable: bool) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    if writable {
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    }
    Ok(())
}

impl DbPool {
    pub fn open(path: &Path, reader_count: usize) -> anyhow::Result<Self> {
        let writer = Connection::open(path)?;
        apply_pragmas(&writer, true)?;

        let mut readers = Vec::with_capacity(reader_count);
        for _ in 0..reader_count {
            let r = Connection::open(path)?;
            apply_pragmas(&r, false)?;
            readers.push(Mutex::new(r));
        }

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    pub fn write<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Connection) -> anyhow::Result<T>,
    {
        let conn = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("writer lock poisoned"))?;
        f(&conn)
    }

    pub fn read<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Connection) -> anyhow::Result<T>,
    {
        if self.readers.is_empty() {
            return Err(anyhow::anyhow!("pool opened with no reader connections"));
        }
        // Start from a rotating offset so one slow reader doesn't serialize
        // everyone behind slot 0.
        let start = self.next_reader.fetch_add(1, Ordering::Relaxed);
        for i in 0..self.readers.len() {
            let idx = (start + i) % self.readers.len();
            if let Ok(conn) = self.readers[idx].try_lock() {
                return f(&conn);
            }
        }
        let conn = self.readers[start % self.readers.len()]
            .lock()
            .map_err(|_| anyhow::anyhow!("reader lock poisoned"))?;
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_sees_data() {
        let path = std::env::temp_dir().join(format!("palletbase-pool-{}.db", uuid::Uuid::new_v4()));
        let pool = DbPool::open(&path, 2).unwrap();
        pool.write(|conn| {
            conn.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('x');")?;
            Ok(())
        })
        .unwrap();

        let v: String = pool
            .read(|conn| Ok(conn.query_row("SELECT v FROM t", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(v, "x");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn single_reader_wraps_rotating_offset() {
        let path = std::env::temp_dir().join(format!("palletbase-pool-{}.db", uuid::Uuid::new_v4()));
        let pool = DbPool::open(&path, 1).unwrap();
        for _ in 0..5 {
            pool.read(|_| Ok(())).unwrap();
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn zero_readers_reports_error() {
        let path = std::env::temp_dir().join(format!("palletbase-pool-{}.db", uuid::Uuid::new_v4()));
        let pool = DbPool::open(&path, 0).unwrap();
        assert!(pool.read(|_| Ok(())).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
