use crate::error::Error;
use crate::tenant::TenantRecord;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Routes data access to one tenant's physical database.
///
/// Handles are explicit per-tenant values, never a process-wide slot: a
/// caller holds an `Arc<TenantConn>` for exactly the database it asked for,
/// so two tasks working on different tenants can never see each other's
/// statements. Handles are cached per database name; `purge` discards a
/// cached handle so no statements land on a stale connection.
pub struct ConnectionRouter {
    tenant_dir: PathBuf,
    handles: Mutex<HashMap<String, Arc<TenantConn>>>,
}

/// Mutex-guarded connection to one tenant database.
#[derive(Debug)]
pub struct TenantConn {
    database_name: String,
    conn: Mutex<Connection>,
}

impl TenantConn {
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn with<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Connection) -> anyhow::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("tenant connection lock poisoned"))?;
        f(&conn)
    }
}

fn open_with_pragmas(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    // All timestamps written through tenant connections are RFC3339 UTC.
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

impl ConnectionRouter {
    pub fn new(tenant_dir: impl Into<PathBuf>) -> Self {
        Self {
            tenant_dir: tenant_dir.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn database_path(&self, database_name: &str) -> PathBuf {
        self.tenant_dir.join(format!("{database_name}.db"))
    }

    pub fn database_exists(&self, database_name: &str) -> bool {
        self.database_path(database_name).exists()
    }

    /// Create the physical database file if absent. Idempotent: an existing
    /// database is left untouched.
    pub fn create_database(&self, database_name: &str) -> Result<(), Error> {
        let path = self.database_path(database_name);
        if path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.tenant_dir).map_err(|e| {
            Error::ConnectionRouting(format!(
                "cannot create tenant dir {}: {}",
                self.tenant_dir.display(),
                e
            ))
        })?;
        open_with_pragmas(&path).map_err(|e| {
            Error::ConnectionRouting(format!("cannot create database {database_name}: {e}"))
        })?;
        tracing::info!("created tenant database {}", database_name);
        Ok(())
    }

    /// Connection handle for `tenant`'s database. The database must already
    /// exist — routing to a missing database is a hard failure, not an
    /// implicit create.
    pub fn connect(&self, tenant: &TenantRecord) -> Result<Arc<TenantConn>, Error> {
        let name = tenant.database_name.as_str();
        {
            let handles = self.handles.lock().expect("router lock poisoned");
            if let Some(handle) = handles.get(name) {
                return Ok(Arc::clone(handle));
            }
        }

        let path = self.database_path(name);
        if !path.exists() {
            return Err(Error::ConnectionRouting(format!(
                "database {} does not exist for tenant {}",
                name, tenant.subdomain
            )));
        }
        let conn = open_with_pragmas(&path).map_err(|e| {
            Error::ConnectionRouting(format!("cannot open database {name}: {e}"))
        })?;
        let handle = Arc::new(TenantConn {
            database_name: name.to_string(),
            conn: Mutex::new(conn),
        });

        let mut handles = self.handles.lock().expect("router lock poisoned");
        // A racing connect may have inserted first; keep the existing handle
        // so all callers share one connection per database.
        Ok(Arc::clone(
            handles
                .entry(name.to_string())
                .or_insert_with(|| Arc::clone(&handle)),
        ))
    }

    /// Discard the cached handle for a database. Outstanding `Arc`s stay
    /// usable; the next `connect` opens fresh.
    pub fn purge(&self, database_name: &str) {
        let mut handles = self.handles.lock().expect("router lock poisoned");
        handles.remove(database_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::{TenantRecord, TenantStatus};

    struct TempDir {
        path: PathBuf,
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    fn temp_router() -> (ConnectionRouter, TempDir) {
        let path = std::env::temp_dir().join(format!("palletbase-router-{}", uuid::Uuid::new_v4()));
        let guard = TempDir { path: path.clone() };
        (ConnectionRouter::new(path), guard)
    }

    fn tenant(name: &str) -> TenantRecord {
        TenantRecord {
            id: 1,
            subdomain: name.into(),
            database_name: format!("tenant_{name}"),
            status: TenantStatus::Pending,
            onboarding_step: 0,
            onboarding_error: None,
            onboarding_failed_at: None,
            plan: "free".into(),
            timezone: "UTC".into(),
            admin_email: "a@x.com".into(),
            company_name: "Acme".into(),
            primary_color: "#1f6feb".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn create_database_is_idempotent() {
        let (router, _tmp) = temp_router();
        router.create_database("tenant_acme").unwrap();
        assert!(router.database_exists("tenant_acme"));
        router.create_database("tenant_acme").unwrap();
    }

    #[test]
    fn connect_to_missing_database_is_routing_error() {
        let (router, _tmp) = temp_router();
        let err = router.connect(&tenant("ghost")).unwrap_err();
        assert!(matches!(err, Error::ConnectionRouting(_)));
    }

    #[test]
    fn handles_are_isolated_per_tenant() {
        let (router, _tmp) = temp_router();
        router.create_database("tenant_acme").unwrap();
        router.create_database("tenant_globex").unwrap();

        let acme = router.connect(&tenant("acme")).unwrap();
        let globex = router.connect(&tenant("globex")).unwrap();

        acme.with(|conn| {
            conn.execute_batch("CREATE TABLE only_acme (v TEXT)")?;
            Ok(())
        })
        .unwrap();

        // The other tenant's database must not see the table.
        let seen: bool = globex
            .with(|conn| {
                Ok(conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = 'only_acme')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert!(!seen);
    }

    #[test]
    fn connect_reuses_cached_handle_until_purged() {
        let (router, _tmp) = temp_router();
        router.create_database("tenant_acme").unwrap();

        let first = router.connect(&tenant("acme")).unwrap();
        let second = router.connect(&tenant("acme")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        router.purge("tenant_acme");
        let third = router.connect(&tenant("acme")).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
