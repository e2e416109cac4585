use anyhow::Context;
use clap::{Parser, Subcommand};
use palletbase::{
    alerts, config,
    db::{self, pool::DbPool},
    email::EmailService,
    jobs::{Job, JobQueue},
    migrate,
    state::{AppState, SharedState},
    tenant::{self, cache::TenantCache, lifecycle, router::ConnectionRouter, TenantStatus},
};
use std::time::Duration;
use tracing::info;

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "palletbase", about = "Palletbase Multi-Tenant Platform", version)]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long, default_value = "palletbase.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialise data directories and the central registry database
    Bootstrap,
    /// Register a new tenant and run its provisioning pipeline
    Register {
        /// Tenant subdomain (lowercase alphanumeric + hyphens)
        #[arg(long)]
        subdomain: String,
        /// Tenant admin email address
        #[arg(long)]
        admin_email: String,
        #[arg(long, default_value = "free")]
        plan: String,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        #[arg(long, default_value = "")]
        company: String,
        #[arg(long, default_value = "#1f6feb")]
        color: String,
    },
    /// Re-run provisioning for a tenant (resumes after the last completed step)
    Provision {
        #[arg(long)]
        subdomain: String,
        /// Reset onboarding to step 0 first (re-runs every step)
        #[arg(long)]
        reset: bool,
    },
    /// Show a tenant's registration, onboarding and migration status
    Status {
        #[arg(long)]
        subdomain: String,
    },
    /// Apply pending schema migrations to one tenant database
    Migrate {
        #[arg(long)]
        subdomain: String,
        #[arg(long)]
        triggered_by: Option<String>,
    },
    /// Apply pending schema migrations to every active tenant
    MigrateAll {
        #[arg(long)]
        triggered_by: Option<String>,
    },
    /// Transition a tenant's lifecycle status
    SetStatus {
        #[arg(long)]
        subdomain: String,
        /// Target status: active, suspended or cancelled
        #[arg(long)]
        to: String,
    },
    /// Run the operational detectors (stuck onboarding, pending migrations)
    Check,
    /// List operational alerts
    Alerts {
        /// Include resolved alerts
        #[arg(long)]
        all: bool,
    },
    /// Resolve an alert
    ResolveAlert {
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "operator")]
        by: String,
    },
}

// ── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging from RUST_LOG (default: info)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "palletbase=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;

    match cli.command {
        Commands::Bootstrap => bootstrap(cfg),
        Commands::Register {
            subdomain,
            admin_email,
            plan,
            timezone,
            company,
            color,
        } => {
            let state = open_state(cfg)?;
            register(state, &subdomain, &admin_email, &plan, &timezone, &company, &color).await
        }
        Commands::Provision { subdomain, reset } => {
            let state = open_state(cfg)?;
            provision(state, &subdomain, reset).await
        }
        Commands::Status { subdomain } => {
            let state = open_state(cfg)?;
            status(state, &subdomain)
        }
        Commands::Migrate {
            subdomain,
            triggered_by,
        } => {
            let state = open_state(cfg)?;
            run_migrations(state, &subdomain, triggered_by.as_deref()).await
        }
        Commands::MigrateAll { triggered_by } => {
            let state = open_state(cfg)?;
            run_all_migrations(state, triggered_by.as_deref()).await
        }
        Commands::SetStatus { subdomain, to } => {
            let state = open_state(cfg)?;
            set_status(state, &subdomain, &to)
        }
        Commands::Check => {
            let state = open_state(cfg)?;
            check(state)
        }
        Commands::Alerts { all } => {
            let state = open_state(cfg)?;
            list_alerts(state, all)
        }
        Commands::ResolveAlert { id, by } => {
            let state = open_state(cfg)?;
            resolve_alert(state, &id, &by)
        }
    }
}

// ── Bootstrap ──────────────────────────────────────────────────────────────

fn bootstrap(cfg: config::PlatformConfig) -> anyhow::Result<()> {
    info!("Starting bootstrap...");

    if let Some(parent) = cfg.registry_db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create registry dir: {}", parent.display()))?;
        }
    }
    std::fs::create_dir_all(&cfg.tenant_db_dir).with_context(|| {
        format!("failed to create tenant dir: {}", cfg.tenant_db_dir.display())
    })?;

    let db = DbPool::open(&cfg.registry_db_path, 1).context("failed to open registry database")?;
    db::run_migrations(&db).context("failed to run registry migrations")?;
    info!("Registry migrations applied");

    info!(
        "Bootstrap complete. registry={}, tenants={}",
        cfg.registry_db_path.display(),
        cfg.tenant_db_dir.display()
    );
    Ok(())
}

// ── Shared wiring ──────────────────────────────────────────────────────────

fn open_state(cfg: config::PlatformConfig) -> anyhow::Result<SharedState> {
    if !cfg.registry_db_path.exists() {
        anyhow::bail!(
            "registry database {} not found — run `bootstrap` first",
            cfg.registry_db_path.display()
        );
    }
    let db = DbPool::open(&cfg.registry_db_path, 4).context("failed to open registry database")?;
    db::run_migrations(&db).context("failed to run registry migrations")?;

    let router = ConnectionRouter::new(cfg.tenant_db_dir.clone());
    let cache = TenantCache::new(cfg.cache_ttl_secs);

    // Email service (only if SMTP is configured)
    let email = cfg.smtp.as_ref().and_then(|smtp_cfg| {
        match EmailService::new(smtp_cfg) {
            Ok(svc) => {
                info!("Email service ready (SMTP: {}:{})", smtp_cfg.host, smtp_cfg.port);
                Some(svc)
            }
            Err(e) => {
                tracing::warn!("SMTP not available: {} — welcome notices will be logged", e);
                None
            }
        }
    });

    Ok(AppState::new(cfg, db, router, cache, email))
}

fn lookup_tenant(state: &SharedState, subdomain: &str) -> anyhow::Result<tenant::TenantRecord> {
    state
        .cache
        .remember(subdomain, || tenant::fetch_by_subdomain(&state.db, subdomain))?
        .with_context(|| format!("tenant '{}' not found", subdomain))
}

// ── Tenant commands ────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn register(
    state: SharedState,
    subdomain: &str,
    admin_email: &str,
    plan: &str,
    timezone: &str,
    company: &str,
    color: &str,
) -> anyhow::Result<()> {
    let t = tenant::register(
        &state.db,
        tenant::NewTenant {
            subdomain,
            admin_email,
            plan,
            timezone,
            company_name: company,
            primary_color: color,
        },
    )?;
    info!("Tenant {} registered (id={})", t.subdomain, t.id);

    let queue = JobQueue::start(state.clone());
    queue.enqueue(Job::Provision { tenant_id: t.id })?;
    queue.finish().await?;

    print_tenant(&state, subdomain)
}

async fn provision(state: SharedState, subdomain: &str, reset: bool) -> anyhow::Result<()> {
    let t = lookup_tenant(&state, subdomain)?;
    if reset {
        tenant::reset_onboarding(&state.db, t.id)?;
        info!("Tenant {} onboarding reset to step 0", t.subdomain);
    }

    let queue = JobQueue::start(state.clone());
    queue.enqueue(Job::Provision { tenant_id: t.id })?;
    queue.finish().await?;

    state.cache.forget(subdomain);
    print_tenant(&state, subdomain)
}

fn status(state: SharedState, subdomain: &str) -> anyhow::Result<()> {
    let t = lookup_tenant(&state, subdomain)?;
    let migrations = match migrate::status(&state.router, &t) {
        Ok(s) => serde_json::to_value(&s)?,
        // A pending tenant may not have a database yet; report that rather
        // than failing the whole status command.
        Err(e) => serde_json::json!({ "unavailable": e.to_string() }),
    };
    let onboarding = serde_json::json!({
        "step": t.onboarding_step,
        "total": tenant::TOTAL_STEPS,
        "error": t.onboarding_error,
        "failed_at": t.onboarding_failed_at,
    });
    let payload = serde_json::json!({
        "tenant": t,
        "onboarding": onboarding,
        "migrations": migrations,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn print_tenant(state: &SharedState, subdomain: &str) -> anyhow::Result<()> {
    // Bypass the cache — the pipeline just mutated the row.
    let t = tenant::fetch_by_subdomain(&state.db, subdomain)?
        .with_context(|| format!("tenant '{}' not found", subdomain))?;
    println!("{}", serde_json::to_string_pretty(&t)?);
    Ok(())
}

fn set_status(state: SharedState, subdomain: &str, to: &str) -> anyhow::Result<()> {
    let target = TenantStatus::parse(to)
        .with_context(|| format!("unknown status '{}' (active, suspended, cancelled)", to))?;
    let t = lookup_tenant(&state, subdomain)?;
    let updated = lifecycle::change_status(&state.db, &state.cache, &t, target)?;
    info!("Tenant {} is now {}", updated.subdomain, updated.status);
    println!("{}", serde_json::to_string_pretty(&updated)?);
    Ok(())
}

// ── Migration commands ─────────────────────────────────────────────────────

async fn run_migrations(
    state: SharedState,
    subdomain: &str,
    triggered_by: Option<&str>,
) -> anyhow::Result<()> {
    let t = lookup_tenant(&state, subdomain)?;

    let queue = JobQueue::start(state.clone());
    let record = migrate::run(&state.db, &queue, &t, triggered_by)?;
    queue.finish().await?;

    let finished = migrate::fetch_run(&state.db, &record.id)?
        .context("migration run record disappeared")?;
    println!("{}", serde_json::to_string_pretty(&finished)?);
    if !finished.success {
        anyhow::bail!("migration run {} failed", finished.id);
    }
    Ok(())
}

async fn run_all_migrations(state: SharedState, triggered_by: Option<&str>) -> anyhow::Result<()> {
    let queue = JobQueue::start(state.clone());
    let dispatched = migrate::run_all(&state.db, &queue, triggered_by)?;
    queue.finish().await?;
    info!("Dispatched migration runs for {} active tenants", dispatched);
    Ok(())
}

// ── Operational commands ───────────────────────────────────────────────────

fn check(state: SharedState) -> anyhow::Result<()> {
    let stuck = alerts::detect_stuck_onboarding(
        &state.db,
        Duration::from_secs(state.config.stuck_after_mins * 60),
    )?;
    let pending = alerts::detect_pending_migrations(&state.db, &state.router)?;
    info!(
        "Detectors complete: {} stuck tenants, {} tenants with pending migrations",
        stuck, pending
    );
    Ok(())
}

fn list_alerts(state: SharedState, include_resolved: bool) -> anyhow::Result<()> {
    let rows = alerts::list(&state.db, include_resolved)?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn resolve_alert(state: SharedState, id: &str, by: &str) -> anyhow::Result<()> {
    alerts::resolve(&state.db, id, by)?;
    info!("Alert {} resolved by {}", id, by);
    Ok(())
}
