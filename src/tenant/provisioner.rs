use crate::db::pool::DbPool;
use crate::email::EmailService;
use crate::error::Error;
use crate::migrate;
use crate::tenant::{
    self, cache::TenantCache, lifecycle, router::ConnectionRouter, TenantRecord, TenantStatus,
    TOTAL_STEPS,
};
use anyhow::Context;
use rusqlite::Connection;

const STEP_LABELS: [&str; TOTAL_STEPS as usize] = [
    "verify registration",
    "create database",
    "run migrations",
    "seed catalog data",
    "create admin account",
    "sync settings",
    "activate tenant",
    "send welcome notice",
];

pub fn step_label(step: u8) -> &'static str {
    STEP_LABELS[(step as usize) - 1]
}

/// Baseline catalog loaded into every new tenant database.
const DEFAULT_BOX_TYPES: &[(&str, &str, i64)] = &[
    ("STD", "Standard carton", 24),
    ("HALF", "Half carton", 12),
    ("BULK", "Bulk bin", 200),
];

const DEFAULT_PALLET_TYPES: &[(&str, &str, i64)] = &[
    ("EUR", "Euro pallet 800x1200", 32),
    ("IND", "Industrial pallet 1000x1200", 40),
];

/// Run the provisioning pipeline for one tenant.
///
/// Resumes after the last completed step: a tenant at `onboarding_step = N`
/// executes only steps `N+1..=8`, and each step persists its completion
/// immediately so a crash between steps loses nothing. Every step is
/// idempotent on its own terms (existence checks before create) because a
/// step can be re-entered after a partial prior failure.
///
/// On step failure the error is persisted onto the tenant row
/// (`onboarding_error`, `onboarding_failed_at`) and re-raised unchanged.
/// Retry is the caller's job.
pub async fn run(
    db: &DbPool,
    router: &ConnectionRouter,
    cache: &TenantCache,
    email: Option<&EmailService>,
    tenant_id: i64,
) -> Result<(), Error> {
    let mut tenant = tenant::fetch(db, tenant_id)?
        .ok_or_else(|| anyhow::anyhow!("tenant {} is not registered", tenant_id))?;

    if tenant.onboarding_step >= TOTAL_STEPS {
        tracing::info!("tenant {} is already fully provisioned", tenant.subdomain);
        return Ok(());
    }

    // Residual failure fields from an earlier attempt are cleared once, at
    // invocation start.
    if tenant.onboarding_error.is_some() || tenant.onboarding_failed_at.is_some() {
        tenant::clear_failure(db, tenant.id)?;
        tenant.onboarding_error = None;
        tenant.onboarding_failed_at = None;
    }

    let start = tenant.onboarding_step + 1;
    tracing::info!(
        "provisioning tenant {} from step {} of {}",
        tenant.subdomain,
        start,
        TOTAL_STEPS
    );

    for step in start..=TOTAL_STEPS {
        if let Err(source) = execute_step(db, router, cache, email, &mut tenant, step).await {
            let err = Error::Step {
                step,
                label: step_label(step),
                source,
            };
            if let Err(persist_err) = tenant::set_failure(db, tenant.id, &err.to_string()) {
                tracing::error!(
                    "tenant {}: could not persist step failure: {}",
                    tenant.id,
                    persist_err
                );
            }
            tracing::error!("tenant {}: {}", tenant.subdomain, err);
            return Err(err);
        }
        tenant::update_step(db, tenant.id, step)?;
        tenant.onboarding_step = step;
        tracing::debug!(
            "tenant {}: step {} ({}) complete",
            tenant.subdomain,
            step,
            step_label(step)
        );
    }

    tracing::info!("tenant {} fully provisioned", tenant.subdomain);
    Ok(())
}

async fn execute_step(
    db: &DbPool,
    router: &ConnectionRouter,
    cache: &TenantCache,
    email: Option<&EmailService>,
    tenant: &mut TenantRecord,
    step: u8,
) -> anyhow::Result<()> {
    match step {
        // The registration row is created by the caller; this step only
        // confirms it still exists and refreshes the in-memory copy.
        1 => {
            let fresh = tenant::fetch(db, tenant.id)?
                .with_context(|| format!("registration row for tenant {} is missing", tenant.id))?;
            *tenant = fresh;
            Ok(())
        }
        2 => {
            if router.database_exists(&tenant.database_name) {
                tracing::debug!("database {} already exists", tenant.database_name);
                return Ok(());
            }
            router.create_database(&tenant.database_name)?;
            Ok(())
        }
        3 => {
            let conn = router.connect(tenant)?;
            let (count, _) = conn.with(migrate::apply_pending)?;
            if count > 0 {
                tracing::info!("tenant {}: applied {} migrations", tenant.subdomain, count);
            }
            Ok(())
        }
        4 => {
            let conn = router.connect(tenant)?;
            conn.with(seed_catalog)
        }
        5 => {
            let conn = router.connect(tenant)?;
            let admin_email = tenant.admin_email.clone();
            let created = conn.with(|c| create_admin_if_absent(c, &admin_email))?;
            if !created {
                tracing::debug!(
                    "tenant {}: admin {} already exists",
                    tenant.subdomain,
                    admin_email
                );
            }
            Ok(())
        }
        6 => {
            let conn = router.connect(tenant)?;
            conn.with(|c| sync_settings(c, tenant))
        }
        7 => {
            lifecycle::activate_provisioned(db, cache, tenant)?;
            tenant.status = TenantStatus::Active;
            Ok(())
        }
        8 => send_welcome(email, tenant).await,
        _ => anyhow::bail!("unknown provisioning step {}", step),
    }
}

/// Load the default catalog unless the tenant already has one.
fn seed_catalog(conn: &Connection) -> anyhow::Result<()> {
    let existing: i64 = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM box_types) + (SELECT COUNT(*) FROM pallet_types)",
        [],
        |row| row.get(0),
    )?;
    if existing > 0 {
        return Ok(());
    }

    for (code, label, units) in DEFAULT_BOX_TYPES {
        conn.execute(
            "INSERT INTO box_types (code, label, units_per_box) VALUES (?1, ?2, ?3)",
            rusqlite::params![code, label, units],
        )?;
    }
    for (code, label, max_boxes) in DEFAULT_PALLET_TYPES {
        conn.execute(
            "INSERT INTO pallet_types (code, label, max_boxes) VALUES (?1, ?2, ?3)",
            rusqlite::params![code, label, max_boxes],
        )?;
    }
    Ok(())
}

/// Returns `true` if a new admin row was inserted, `false` if one already
/// existed for this email.
fn create_admin_if_absent(conn: &Connection, email: &str) -> anyhow::Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM users WHERE email = ?1",
        [email],
        |row| row.get(0),
    )?;
    if exists {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO users (id, email, role) VALUES (?1, ?2, 'admin')",
        rusqlite::params![uuid::Uuid::new_v4().to_string(), email],
    )?;
    Ok(true)
}

/// Copy the registry-owned descriptive fields into tenant-local settings.
fn sync_settings(conn: &Connection, tenant: &TenantRecord) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let pairs: [(&str, &str); 5] = [
        ("subdomain", &tenant.subdomain),
        ("plan", &tenant.plan),
        ("timezone", &tenant.timezone),
        ("company_name", &tenant.company_name),
        ("primary_color", &tenant.primary_color),
    ];
    for (key, value) in pairs {
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, value, now],
        )?;
    }
    Ok(())
}

async fn send_welcome(email: Option<&EmailService>, tenant: &TenantRecord) -> anyhow::Result<()> {
    match email {
        Some(svc) => {
            svc.send_welcome(&tenant.admin_email, &tenant.subdomain, &tenant.company_name)
                .await
        }
        None => {
            tracing::info!(
                "SMTP not configured — welcome notice for {} ({}) logged only",
                tenant.subdomain,
                tenant.admin_email
            );
            Ok(())
        }
    }
}
