pub mod pool;

use pool::DbPool;

/// Registry schema, applied in order. The per-tenant schema lives in
/// `crate::migrate` and is tracked separately with batch numbers.
const MIGRATIONS: &[(&str, &str)] = &[
    ("001_tenants", include_str!("migrations/001_tenants.sql")),
    (
        "002_migration_runs",
        include_str!("migrations/002_migration_runs.sql"),
    ),
    ("003_alerts", include_str!("migrations/003_alerts.sql")),
];

pub fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    pool.write(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            )",
        )?;

        for (name, sql) in MIGRATIONS {
            let applied: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM _migrations WHERE name = ?1",
                [name],
                |row| row.get(0),
            )?;

            if !applied {
                conn.execute_batch(sql)?;
                conn.execute("INSERT INTO _migrations (name) VALUES (?1)", [name])?;
                tracing::info!("applied registry migration: {}", name);
            }
        }
        Ok(())
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::path::PathBuf;

    /// File-backed temp registry with schema applied; files removed on drop.
    pub struct TempRegistry {
        pub path: PathBuf,
    }

    impl Drop for TempRegistry {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
            let _ = std::fs::remove_file(self.path.with_extension("db-wal"));
            let _ = std::fs::remove_file(self.path.with_extension("db-shm"));
        }
    }

    pub fn open_temp_registry() -> (DbPool, TempRegistry) {
        let path = std::env::temp_dir().join(format!(
            "palletbase-registry-{}.db",
            uuid::Uuid::new_v4()
        ));
        let guard = TempRegistry { path: path.clone() };
        let pool = DbPool::open(&path, 1).expect("open registry");
        run_migrations(&pool).expect("registry migrations");
        (pool, guard)
    }
}
