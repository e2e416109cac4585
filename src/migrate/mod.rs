pub mod parser;

use crate::db::pool::DbPool;
use crate::error::Error;
use crate::jobs::{Job, JobQueue};
use crate::tenant::{self, router::ConnectionRouter, TenantRecord};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

/// Per-tenant schema, applied in order. Tracked in each tenant database's
/// `schema_migrations` table with a batch number per apply run.
const TENANT_MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_create_users",
        include_str!("tenant_migrations/0001_create_users.sql"),
    ),
    (
        "0002_create_settings",
        include_str!("tenant_migrations/0002_create_settings.sql"),
    ),
    (
        "0003_create_catalog",
        include_str!("tenant_migrations/0003_create_catalog.sql"),
    ),
    (
        "0004_create_orders",
        include_str!("tenant_migrations/0004_create_orders.sql"),
    ),
    (
        "0005_create_pallets",
        include_str!("tenant_migrations/0005_create_pallets.sql"),
    ),
    (
        "0006_create_productions",
        include_str!("tenant_migrations/0006_create_productions.sql"),
    ),
];

#[derive(Debug, Clone, Serialize)]
pub struct MigrationEntry {
    pub name: String,
    pub ran: bool,
    pub batch: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct MigrationStatus {
    pub migrations: Vec<MigrationEntry>,
    pub total: usize,
    pub ran: usize,
    pub pending: usize,
    #[serde(skip)]
    pub raw_output: String,
}

/// Audit row for one migration execution against one tenant database.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRunRecord {
    pub id: String,
    pub tenant_id: i64,
    pub triggered_by: Option<String>,
    pub migrations_applied: u32,
    pub output: String,
    pub success: bool,
    pub started_at: String,
    pub finished_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Tenant-database schema operations
// ---------------------------------------------------------------------------

fn ensure_tracking_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            batch INTEGER NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        )",
    )
}

fn applied_batches(conn: &Connection) -> anyhow::Result<HashMap<String, u32>> {
    ensure_tracking_table(conn)?;
    let mut stmt = conn.prepare("SELECT name, batch FROM schema_migrations")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

/// Apply every pending migration in one batch. Returns the applied count and
/// the tool-style text log (one `... DONE` line per applied migration).
pub fn apply_pending(conn: &Connection) -> anyhow::Result<(usize, String)> {
    let applied = applied_batches(conn)?;
    let batch: u32 = conn.query_row(
        "SELECT COALESCE(MAX(batch), 0) + 1 FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    let mut output = String::new();
    let mut count = 0usize;
    for (name, sql) in TENANT_MIGRATIONS {
        if applied.contains_key(*name) {
            continue;
        }
        writeln!(output, "Migrating: {name}")?;
        conn.execute_batch(sql)
            .map_err(|e| anyhow::anyhow!("migration {} failed: {}", name, e))?;
        conn.execute(
            "INSERT INTO schema_migrations (name, batch) VALUES (?1, ?2)",
            rusqlite::params![name, batch],
        )?;
        writeln!(output, "Migrated:  {name} ... DONE")?;
        count += 1;
    }
    if count == 0 {
        output.push_str("Nothing to migrate.\n");
    }
    Ok((count, output))
}

/// Render the tool's status output (pipe-table form, the richer of the two
/// accepted formats — it carries batch numbers).
pub fn status_output(conn: &Connection) -> anyhow::Result<String> {
    let applied = applied_batches(conn)?;
    let mut out = String::from("| Ran? | Migration | Batch |\n");
    for (name, _) in TENANT_MIGRATIONS {
        match applied.get(*name) {
            Some(batch) => writeln!(out, "| Yes | {name} | {batch} |")?,
            None => writeln!(out, "| No | {name} |  |")?,
        }
    }
    Ok(out)
}

/// Structured migration status for one tenant: raw tool output, normalised
/// through the dual-format parser.
pub fn status(router: &ConnectionRouter, tenant: &TenantRecord) -> Result<MigrationStatus, Error> {
    let conn = router.connect(tenant)?;
    let raw = conn.with(status_output)?;

    let migrations: Vec<MigrationEntry> = parser::parse_status(&raw)
        .into_iter()
        .map(|m| MigrationEntry {
            name: m.name,
            ran: m.ran,
            batch: m.batch,
        })
        .collect();
    let ran = migrations.iter().filter(|m| m.ran).count();
    let total = migrations.len();
    Ok(MigrationStatus {
        pending: total - ran,
        ran,
        total,
        migrations,
        raw_output: raw,
    })
}

pub fn pending_count(router: &ConnectionRouter, tenant: &TenantRecord) -> Result<usize, Error> {
    Ok(status(router, tenant)?.pending)
}

// ---------------------------------------------------------------------------
// Run records (registry audit trail)
// ---------------------------------------------------------------------------

fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<MigrationRunRecord> {
    Ok(MigrationRunRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        triggered_by: row.get(2)?,
        migrations_applied: row.get(3)?,
        output: row.get(4)?,
        success: row.get(5)?,
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
    })
}

const RUN_COLUMNS: &str =
    "id, tenant_id, triggered_by, migrations_applied, output, success, started_at, finished_at";

/// Create the audit row at dispatch time (`success=false`, no finish).
pub fn insert_run(
    db: &DbPool,
    tenant_id: i64,
    triggered_by: Option<&str>,
) -> anyhow::Result<MigrationRunRecord> {
    let id = uuid::Uuid::new_v4().to_string();
    let started_at = chrono::Utc::now().to_rfc3339();
    db.write(|conn| {
        conn.execute(
            "INSERT INTO migration_runs (id, tenant_id, triggered_by, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, tenant_id, triggered_by, started_at],
        )?;
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM migration_runs WHERE id = ?1"),
            [&id],
            map_run,
        )
        .map_err(Into::into)
    })
}

/// Complete the audit row exactly once. A second completion attempt is an
/// error — the row is immutable after `finished_at` is set.
pub fn complete_run(
    db: &DbPool,
    run_id: &str,
    success: bool,
    applied: usize,
    output: &str,
) -> anyhow::Result<()> {
    let finished_at = chrono::Utc::now().to_rfc3339();
    db.write(|conn| {
        let changed = conn.execute(
            "UPDATE migration_runs
             SET success = ?1, migrations_applied = ?2, output = ?3, finished_at = ?4
             WHERE id = ?5 AND finished_at IS NULL",
            rusqlite::params![success, applied as i64, output, finished_at, run_id],
        )?;
        if changed == 0 {
            anyhow::bail!("migration run {} already finished or unknown", run_id);
        }
        Ok(())
    })
}

pub fn fetch_run(db: &DbPool, run_id: &str) -> anyhow::Result<Option<MigrationRunRecord>> {
    db.read(|conn| {
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM migration_runs WHERE id = ?1"),
            [run_id],
            map_run,
        )
        .optional()
        .map_err(Into::into)
    })
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Dispatch an async migration run for one tenant. The audit row exists
/// before this returns; execution happens on the job queue.
pub fn run(
    db: &DbPool,
    queue: &JobQueue,
    tenant: &TenantRecord,
    triggered_by: Option<&str>,
) -> anyhow::Result<MigrationRunRecord> {
    let record = insert_run(db, tenant.id, triggered_by)?;
    queue.enqueue(Job::Migrate {
        run_id: record.id.clone(),
        tenant_id: tenant.id,
    })?;
    tracing::info!(
        "migration run {} dispatched for tenant {}",
        record.id,
        tenant.subdomain
    );
    Ok(record)
}

/// One independent run per active tenant. Returns the number dispatched.
pub fn run_all(db: &DbPool, queue: &JobQueue, triggered_by: Option<&str>) -> anyhow::Result<usize> {
    let tenants = tenant::list_active(db)?;
    for t in &tenants {
        run(db, queue, t, triggered_by)?;
    }
    Ok(tenants.len())
}

/// Worker-side execution of one dispatched run: route to the tenant
/// database, apply pending migrations under a hard timeout, complete the
/// audit row exactly once. Errors are recorded into the row's output and
/// re-raised so the job runner's failure path engages.
pub async fn execute_run(
    db: &DbPool,
    router: &ConnectionRouter,
    timeout: Duration,
    run_id: &str,
    tenant_id: i64,
) -> Result<(), Error> {
    let tenant = tenant::fetch(db, tenant_id)?
        .ok_or_else(|| anyhow::anyhow!("tenant {} not found for migration run", tenant_id))?;

    let outcome = match router.connect(&tenant) {
        Err(route_err) => Err(route_err),
        Ok(conn) => {
            let task = tokio::task::spawn_blocking(move || conn.with(apply_pending));
            match tokio::time::timeout(timeout, task).await {
                Err(_) => Err(Error::MigrationTool(format!(
                    "run exceeded {}s time budget",
                    timeout.as_secs()
                ))),
                Ok(Err(join_err)) => Err(Error::MigrationTool(format!(
                    "migration task aborted: {join_err}"
                ))),
                Ok(Ok(Err(apply_err))) => Err(Error::MigrationTool(apply_err.to_string())),
                Ok(Ok(Ok(result))) => Ok(result),
            }
        }
    };

    match outcome {
        Ok((count, output)) => {
            complete_run(db, run_id, true, count, &output)?;
            tracing::info!(
                "migration run {} for tenant {} applied {} migrations",
                run_id,
                tenant.subdomain,
                count
            );
            Ok(())
        }
        Err(err) => {
            if let Err(record_err) = complete_run(db, run_id, false, 0, &err.to_string()) {
                tracing::error!(
                    "failed to record migration failure for run {}: {}",
                    run_id,
                    record_err
                );
            }
            Err(err)
        }
    }
}
