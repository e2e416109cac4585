use crate::db::pool::DbPool;
use crate::tenant::{self, router::ConnectionRouter};
use rusqlite::OptionalExtension;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    OnboardingFailed,
    OnboardingStuck,
    MigrationsPending,
    QueueStopped,
    SuspiciousActivity,
}

impl AlertKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "onboarding_failed" => Some(AlertKind::OnboardingFailed),
            "onboarding_stuck" => Some(AlertKind::OnboardingStuck),
            "migrations_pending" => Some(AlertKind::MigrationsPending),
            "queue_stopped" => Some(AlertKind::QueueStopped),
            "suspicious_activity" => Some(AlertKind::SuspiciousActivity),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::OnboardingFailed => "onboarding_failed",
            AlertKind::OnboardingStuck => "onboarding_stuck",
            AlertKind::MigrationsPending => "migrations_pending",
            AlertKind::QueueStopped => "queue_stopped",
            AlertKind::SuspiciousActivity => "suspicious_activity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub id: String,
    pub kind: String,
    pub severity: String,
    pub tenant_id: Option<i64>,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub resolved_at: Option<String>,
    pub resolved_by: Option<String>,
}

fn map_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRecord> {
    let metadata_text: String = row.get(5)?;
    Ok(AlertRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        severity: row.get(2)?,
        tenant_id: row.get(3)?,
        message: row.get(4)?,
        metadata: serde_json::from_str(&metadata_text).unwrap_or(serde_json::Value::Null),
        created_at: row.get(6)?,
        resolved_at: row.get(7)?,
        resolved_by: row.get(8)?,
    })
}

const ALERT_COLUMNS: &str =
    "id, kind, severity, tenant_id, message, metadata, created_at, resolved_at, resolved_by";

/// Create an alert unless an unresolved one with the same (kind, tenant)
/// already exists — in that case the existing row is returned unchanged.
/// The check and insert run under the registry writer lock, so two
/// concurrent detectors cannot both insert.
pub fn create_if_not_exists(
    db: &DbPool,
    kind: AlertKind,
    severity: Severity,
    message: &str,
    tenant_id: Option<i64>,
    metadata: serde_json::Value,
) -> anyhow::Result<AlertRecord> {
    db.write(|conn| {
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {ALERT_COLUMNS} FROM alerts
                     WHERE kind = ?1 AND tenant_id IS ?2 AND resolved_at IS NULL"
                ),
                rusqlite::params![kind.as_str(), tenant_id],
                map_alert,
            )
            .optional()?;
        if let Some(alert) = existing {
            return Ok(alert);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO alerts (id, kind, severity, tenant_id, message, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                id,
                kind.as_str(),
                severity.as_str(),
                tenant_id,
                message,
                metadata.to_string(),
                created_at,
            ],
        )?;
        tracing::warn!(
            "alert raised: {} ({}) tenant={:?}: {}",
            kind.as_str(),
            severity.as_str(),
            tenant_id,
            message
        );
        conn.query_row(
            &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
            [&id],
            map_alert,
        )
        .map_err(Into::into)
    })
}

/// Resolve exactly once. Resolving an already-resolved or unknown alert is
/// an error.
pub fn resolve(db: &DbPool, alert_id: &str, resolved_by: &str) -> anyhow::Result<()> {
    let resolved_at = chrono::Utc::now().to_rfc3339();
    db.write(|conn| {
        let changed = conn.execute(
            "UPDATE alerts SET resolved_at = ?1, resolved_by = ?2
             WHERE id = ?3 AND resolved_at IS NULL",
            rusqlite::params![resolved_at, resolved_by, alert_id],
        )?;
        if changed == 0 {
            anyhow::bail!("alert {} is unknown or already resolved", alert_id);
        }
        Ok(())
    })
}

pub fn list(db: &DbPool, include_resolved: bool) -> anyhow::Result<Vec<AlertRecord>> {
    db.read(|conn| {
        let sql = if include_resolved {
            format!("SELECT {ALERT_COLUMNS} FROM alerts ORDER BY created_at DESC")
        } else {
            format!(
                "SELECT {ALERT_COLUMNS} FROM alerts WHERE resolved_at IS NULL ORDER BY created_at DESC"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], map_alert)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

// ---------------------------------------------------------------------------
// Detectors
// ---------------------------------------------------------------------------

/// Raise `onboarding_stuck` for every pending tenant whose last failure is
/// older than `stuck_after`. Returns how many tenants are currently
/// flagged; repeated sweeps dedup into the existing open alert.
pub fn detect_stuck_onboarding(db: &DbPool, stuck_after: Duration) -> anyhow::Result<usize> {
    let cutoff = chrono::Utc::now()
        - chrono::Duration::from_std(stuck_after).unwrap_or_else(|_| chrono::Duration::zero());

    let stalled: Vec<(i64, String, String, i64)> = db.read(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, subdomain, onboarding_failed_at, onboarding_step FROM tenants
             WHERE status = 'pending' AND onboarding_failed_at IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    let mut raised = 0;
    for (tenant_id, subdomain, failed_at, step) in stalled {
        let failed = match chrono::DateTime::parse_from_rfc3339(&failed_at) {
            Ok(ts) => ts.with_timezone(&chrono::Utc),
            Err(e) => {
                tracing::warn!("tenant {}: bad onboarding_failed_at: {}", tenant_id, e);
                continue;
            }
        };
        if failed > cutoff {
            continue;
        }
        create_if_not_exists(
            db,
            AlertKind::OnboardingStuck,
            Severity::Warning,
            &format!("tenant {subdomain} stuck at onboarding step {step}"),
            Some(tenant_id),
            serde_json::json!({ "step": step, "failed_at": failed_at }),
        )?;
        raised += 1;
    }
    Ok(raised)
}

/// Raise `migrations_pending` for every active tenant with unapplied schema
/// migrations.
pub fn detect_pending_migrations(
    db: &DbPool,
    router: &ConnectionRouter,
) -> anyhow::Result<usize> {
    let mut raised = 0;
    for t in tenant::list_active(db)? {
        let pending = match crate::migrate::pending_count(router, &t) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("tenant {}: migration status unavailable: {}", t.subdomain, e);
                continue;
            }
        };
        if pending == 0 {
            continue;
        }
        create_if_not_exists(
            db,
            AlertKind::MigrationsPending,
            Severity::Warning,
            &format!("tenant {} has {} pending migrations", t.subdomain, pending),
            Some(t.id),
            serde_json::json!({ "pending": pending }),
        )?;
        raised += 1;
    }
    Ok(raised)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::open_temp_registry;
    use crate::tenant::NewTenant;

    fn tenant_id(db: &DbPool) -> i64 {
        tenant::register(
            db,
            NewTenant {
                subdomain: "acme",
                admin_email: "a@x.com",
                plan: "free",
                timezone: "UTC",
                company_name: "Acme",
                primary_color: "#1f6feb",
            },
        )
        .unwrap()
        .id
    }

    #[test]
    fn duplicate_unresolved_alert_is_suppressed() {
        let (db, _tmp) = open_temp_registry();
        let tid = tenant_id(&db);

        let first = create_if_not_exists(
            &db,
            AlertKind::OnboardingFailed,
            Severity::Critical,
            "provisioning failed",
            Some(tid),
            serde_json::json!({}),
        )
        .unwrap();
        let second = create_if_not_exists(
            &db,
            AlertKind::OnboardingFailed,
            Severity::Critical,
            "provisioning failed again",
            Some(tid),
            serde_json::json!({}),
        )
        .unwrap();

        assert_eq!(first.id, second.id);
        // The original message survives — the duplicate did not mutate it.
        assert_eq!(second.message, "provisioning failed");
        assert_eq!(list(&db, true).unwrap().len(), 1);
    }

    #[test]
    fn resolved_alert_allows_a_new_one() {
        let (db, _tmp) = open_temp_registry();
        let tid = tenant_id(&db);

        let first = create_if_not_exists(
            &db,
            AlertKind::OnboardingFailed,
            Severity::Critical,
            "m",
            Some(tid),
            serde_json::json!({}),
        )
        .unwrap();
        resolve(&db, &first.id, "ops@x.com").unwrap();

        let third = create_if_not_exists(
            &db,
            AlertKind::OnboardingFailed,
            Severity::Critical,
            "m",
            Some(tid),
            serde_json::json!({}),
        )
        .unwrap();
        assert_ne!(first.id, third.id);
        assert_eq!(list(&db, true).unwrap().len(), 2);
        assert_eq!(list(&db, false).unwrap().len(), 1);
    }

    #[test]
    fn resolve_is_exactly_once() {
        let (db, _tmp) = open_temp_registry();
        let alert = create_if_not_exists(
            &db,
            AlertKind::QueueStopped,
            Severity::Critical,
            "worker gone",
            None,
            serde_json::json!({}),
        )
        .unwrap();
        resolve(&db, &alert.id, "ops@x.com").unwrap();
        assert!(resolve(&db, &alert.id, "ops@x.com").is_err());
    }

    #[test]
    fn global_and_tenant_alerts_dedup_independently() {
        let (db, _tmp) = open_temp_registry();
        let tid = tenant_id(&db);

        create_if_not_exists(
            &db,
            AlertKind::SuspiciousActivity,
            Severity::Warning,
            "global",
            None,
            serde_json::json!({}),
        )
        .unwrap();
        create_if_not_exists(
            &db,
            AlertKind::SuspiciousActivity,
            Severity::Warning,
            "tenant scoped",
            Some(tid),
            serde_json::json!({}),
        )
        .unwrap();
        assert_eq!(list(&db, false).unwrap().len(), 2);
    }

    #[test]
    fn stuck_detector_respects_threshold() {
        let (db, _tmp) = open_temp_registry();
        let tid = tenant_id(&db);
        tenant::set_failure(&db, tid, "Step 3 (run migrations): boom").unwrap();

        // Failure just happened — not stuck yet under a 30 minute threshold.
        let raised = detect_stuck_onboarding(&db, Duration::from_secs(1800)).unwrap();
        assert_eq!(raised, 0);

        // Zero threshold — anything failed is stuck.
        let raised = detect_stuck_onboarding(&db, Duration::from_secs(0)).unwrap();
        assert_eq!(raised, 1);
        // Sweep again: dedup keeps it to one open alert.
        detect_stuck_onboarding(&db, Duration::from_secs(0)).unwrap();
        let open = list(&db, false).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, "onboarding_stuck");
    }

    #[test]
    fn kind_parse_roundtrip() {
        for kind in [
            AlertKind::OnboardingFailed,
            AlertKind::OnboardingStuck,
            AlertKind::MigrationsPending,
            AlertKind::QueueStopped,
            AlertKind::SuspiciousActivity,
        ] {
            assert_eq!(AlertKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AlertKind::parse("unknown"), None);
    }
}
