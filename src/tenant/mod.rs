pub mod cache;
pub mod lifecycle;
pub mod provisioner;
pub mod router;

use crate::db::pool::DbPool;
use rusqlite::OptionalExtension;
use serde::Serialize;

/// Number of provisioning steps; `onboarding_step` ranges over [0, TOTAL_STEPS].
pub const TOTAL_STEPS: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Pending,
    Active,
    Suspended,
    Cancelled,
}

impl TenantStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TenantStatus::Pending),
            "active" => Some(TenantStatus::Active),
            "suspended" => Some(TenantStatus::Suspended),
            "cancelled" => Some(TenantStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Pending => "pending",
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tenant's registration row in the central registry.
///
/// Mutated only by the provisioning pipeline and the lifecycle state
/// machine. The descriptive fields (plan, timezone, admin_email, branding)
/// are consumed by provisioning but never written back.
#[derive(Debug, Clone, Serialize)]
pub struct TenantRecord {
    pub id: i64,
    pub subdomain: String,
    pub database_name: String,
    pub status: TenantStatus,
    pub onboarding_step: u8,
    pub onboarding_error: Option<String>,
    pub onboarding_failed_at: Option<String>,
    pub plan: String,
    pub timezone: String,
    pub admin_email: String,
    pub company_name: String,
    pub primary_color: String,
    pub created_at: String,
}

pub struct NewTenant<'a> {
    pub subdomain: &'a str,
    pub admin_email: &'a str,
    pub plan: &'a str,
    pub timezone: &'a str,
    pub company_name: &'a str,
    pub primary_color: &'a str,
}

/// Validate a tenant subdomain: 3-30 lowercase alphanumeric + hyphens,
/// no leading or trailing hyphens.
pub fn is_valid_subdomain(subdomain: &str) -> bool {
    let len = subdomain.len();
    if !(3..=30).contains(&len) {
        return false;
    }
    if subdomain.starts_with('-') || subdomain.ends_with('-') {
        return false;
    }
    subdomain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Physical database name for a subdomain. Hyphens fold to underscores so
/// the name stays a plain identifier on disk.
pub fn database_name_for(subdomain: &str) -> String {
    format!("tenant_{}", subdomain.replace('-', "_"))
}

const TENANT_COLUMNS: &str = "id, subdomain, database_name, status, onboarding_step, \
     onboarding_error, onboarding_failed_at, plan, timezone, admin_email, \
     company_name, primary_color, created_at";

fn map_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<TenantRecord> {
    let status_str: String = row.get(3)?;
    let status = TenantStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown tenant status '{}'", status_str).into(),
        )
    })?;
    Ok(TenantRecord {
        id: row.get(0)?,
        subdomain: row.get(1)?,
        database_name: row.get(2)?,
        status,
        onboarding_step: row.get::<_, i64>(4)? as u8,
        onboarding_error: row.get(5)?,
        onboarding_failed_at: row.get(6)?,
        plan: row.get(7)?,
        timezone: row.get(8)?,
        admin_email: row.get(9)?,
        company_name: row.get(10)?,
        primary_color: row.get(11)?,
        created_at: row.get(12)?,
    })
}

/// Insert a registration row (`status=pending`, `onboarding_step=0`).
pub fn register(db: &DbPool, input: NewTenant<'_>) -> anyhow::Result<TenantRecord> {
    if !is_valid_subdomain(input.subdomain) {
        anyhow::bail!(
            "invalid subdomain '{}': 3-30 lowercase alphanumeric/hyphen, no edge hyphens",
            input.subdomain
        );
    }
    let database_name = database_name_for(input.subdomain);

    db.write(|conn| {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tenants WHERE subdomain = ?1)",
            [input.subdomain],
            |row| row.get(0),
        )?;
        if exists {
            anyhow::bail!("tenant subdomain '{}' already exists", input.subdomain);
        }

        conn.execute(
            "INSERT INTO tenants
                (subdomain, database_name, admin_email, plan, timezone, company_name, primary_color)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                input.subdomain,
                database_name,
                input.admin_email,
                input.plan,
                input.timezone,
                input.company_name,
                input.primary_color,
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
            [id],
            map_tenant,
        )
        .map_err(Into::into)
    })
}

pub fn fetch(db: &DbPool, id: i64) -> anyhow::Result<Option<TenantRecord>> {
    db.read(|conn| {
        conn.query_row(
            &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
            [id],
            map_tenant,
        )
        .optional()
        .map_err(Into::into)
    })
}

pub fn fetch_by_subdomain(db: &DbPool, subdomain: &str) -> anyhow::Result<Option<TenantRecord>> {
    db.read(|conn| {
        conn.query_row(
            &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE subdomain = ?1"),
            [subdomain],
            map_tenant,
        )
        .optional()
        .map_err(Into::into)
    })
}

pub fn list_active(db: &DbPool) -> anyhow::Result<Vec<TenantRecord>> {
    db.read(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE status = 'active' ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([], map_tenant)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Record completion of one provisioning step. Steps only move forward
/// here; the single backward path is [`reset_onboarding`].
pub fn update_step(db: &DbPool, id: i64, step: u8) -> anyhow::Result<()> {
    db.write(|conn| {
        let changed = conn.execute(
            "UPDATE tenants SET onboarding_step = ?1
             WHERE id = ?2 AND onboarding_step < ?1",
            rusqlite::params![step as i64, id],
        )?;
        if changed == 0 {
            anyhow::bail!("tenant {} step did not advance to {}", id, step);
        }
        Ok(())
    })
}

pub fn set_failure(db: &DbPool, id: i64, message: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    db.write(|conn| {
        conn.execute(
            "UPDATE tenants SET onboarding_error = ?1, onboarding_failed_at = ?2 WHERE id = ?3",
            rusqlite::params![message, now, id],
        )?;
        Ok(())
    })
}

pub fn clear_failure(db: &DbPool, id: i64) -> anyhow::Result<()> {
    db.write(|conn| {
        conn.execute(
            "UPDATE tenants SET onboarding_error = NULL, onboarding_failed_at = NULL WHERE id = ?1",
            [id],
        )?;
        Ok(())
    })
}

pub fn set_status(db: &DbPool, id: i64, status: TenantStatus) -> anyhow::Result<()> {
    db.write(|conn| {
        conn.execute(
            "UPDATE tenants SET status = ?1 WHERE id = ?2",
            rusqlite::params![status.as_str(), id],
        )?;
        Ok(())
    })
}

/// Operator reset after a permanent failure: step back to 0, failure fields
/// cleared, so the next run re-executes the pipeline from the top.
pub fn reset_onboarding(db: &DbPool, id: i64) -> anyhow::Result<()> {
    db.write(|conn| {
        conn.execute(
            "UPDATE tenants SET onboarding_step = 0,
                                onboarding_error = NULL,
                                onboarding_failed_at = NULL
             WHERE id = ?1",
            [id],
        )?;
        Ok(())
    })
}
