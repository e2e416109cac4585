use crate::alerts::{self, AlertKind, Severity};
use crate::error::Error;
use crate::state::SharedState;
use crate::tenant::provisioner;
use crate::{migrate, tenant};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Operator-triggered work that is re-runnable on demand.
    pub fn single_attempt() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn backoff_for(&self, _attempt: u32) -> Duration {
        self.backoff
    }
}

/// Run `task` under `policy`. After the final failed attempt the
/// terminal-failure callback fires once with the error, which is then
/// returned. Guard violations are never retried — repeating the same call
/// cannot change a validation outcome.
pub async fn dispatch_with_retry<T, F, Fut, C>(
    policy: &RetryPolicy,
    label: &str,
    mut task: F,
    on_terminal: C,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    C: FnOnce(&Error),
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match task(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_guard_violation() || attempt >= max => {
                tracing::error!("{}: attempt {}/{} failed permanently: {}", label, attempt, max, err);
                on_terminal(&err);
                return Err(err);
            }
            Err(err) => {
                let delay = policy.backoff_for(attempt);
                tracing::warn!(
                    "{}: attempt {}/{} failed: {}; retrying in {:?}",
                    label,
                    attempt,
                    max,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// In-process guard against two concurrent dispatches for the same tenant.
/// Cross-process duplicates are still possible and rely on the pipeline's
/// idempotent steps.
pub struct SingleFlight {
    inflight: Mutex<HashSet<i64>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Claim the tenant. Returns `false` if a run is already in flight.
    pub fn begin(&self, tenant_id: i64) -> bool {
        let mut set = self.inflight.lock().expect("single-flight lock poisoned");
        set.insert(tenant_id)
    }

    pub fn finish(&self, tenant_id: i64) {
        let mut set = self.inflight.lock().expect("single-flight lock poisoned");
        set.remove(&tenant_id);
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Job queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum Job {
    Provision { tenant_id: i64 },
    Migrate { run_id: String, tenant_id: i64 },
}

/// Queued task execution with at-least-once semantics. One worker task
/// consumes jobs sequentially — one unit of work at a time, the same
/// assumption the rest of the design leans on.
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
    worker: tokio::task::JoinHandle<()>,
    state: SharedState,
}

impl JobQueue {
    pub fn start(state: SharedState) -> Self {
        let worker_state = state.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(async move {
            let guard = SingleFlight::new();
            while let Some(job) = rx.recv().await {
                process(&worker_state, &guard, job).await;
            }
        });
        Self { tx, worker, state }
    }

    pub fn enqueue(&self, job: Job) -> anyhow::Result<()> {
        self.tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("job queue is stopped"))
    }

    /// Close the queue and wait until every queued job has drained. A worker
    /// that died mid-queue is an operational incident, not just an error
    /// return.
    pub async fn finish(self) -> anyhow::Result<()> {
        drop(self.tx);
        if let Err(join_err) = self.worker.await {
            let _ = alerts::create_if_not_exists(
                &self.state.db,
                AlertKind::QueueStopped,
                Severity::Critical,
                "job queue worker stopped before draining",
                None,
                serde_json::json!({ "error": join_err.to_string() }),
            );
            anyhow::bail!("job worker aborted: {}", join_err);
        }
        Ok(())
    }
}

async fn process(state: &SharedState, guard: &SingleFlight, job: Job) {
    match job {
        Job::Provision { tenant_id } => {
            if !guard.begin(tenant_id) {
                tracing::warn!(
                    "provisioning already in flight for tenant {}; duplicate dispatch skipped",
                    tenant_id
                );
                return;
            }
            let policy = RetryPolicy::new(
                state.config.provision_max_attempts,
                Duration::from_secs(state.config.provision_backoff_secs),
            );
            let label = format!("provision tenant {}", tenant_id);
            let _ = dispatch_with_retry(
                &policy,
                &label,
                |_| {
                    provisioner::run(
                        &state.db,
                        &state.router,
                        &state.cache,
                        state.email.as_ref(),
                        tenant_id,
                    )
                },
                |err| on_provision_terminal_failure(state, tenant_id, err),
            )
            .await;
            guard.finish(tenant_id);
        }
        Job::Migrate { run_id, tenant_id } => {
            let timeout = Duration::from_secs(state.config.migration_timeout_secs);
            let label = format!("migration run {}", run_id);
            let _ = dispatch_with_retry(
                &RetryPolicy::single_attempt(),
                &label,
                |_| migrate::execute_run(&state.db, &state.router, timeout, &run_id, tenant_id),
                |_| {}, // the run record already carries the failure
            )
            .await;
        }
    }
}

/// Terminal provisioning failure: the error must be visible in the registry
/// (persisted if the pipeline didn't get that far) and as a critical alert.
fn on_provision_terminal_failure(state: &SharedState, tenant_id: i64, err: &Error) {
    let subdomain = match tenant::fetch(&state.db, tenant_id) {
        Ok(Some(t)) => {
            if t.onboarding_error.is_none() {
                if let Err(persist_err) = tenant::set_failure(&state.db, tenant_id, &err.to_string())
                {
                    tracing::error!(
                        "tenant {}: could not persist terminal failure: {}",
                        tenant_id,
                        persist_err
                    );
                }
            }
            Some(t.subdomain)
        }
        _ => None,
    };

    let message = match &subdomain {
        Some(s) => format!("tenant {} provisioning failed permanently", s),
        None => format!("tenant {} provisioning failed permanently", tenant_id),
    };
    let result = alerts::create_if_not_exists(
        &state.db,
        AlertKind::OnboardingFailed,
        Severity::Critical,
        &message,
        subdomain.is_some().then_some(tenant_id),
        serde_json::json!({ "error": err.to_string() }),
    );
    if let Err(alert_err) = result {
        tracing::error!("could not raise onboarding_failed alert: {}", alert_err);
    }
}
