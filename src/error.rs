use crate::tenant::TenantStatus;

/// Error taxonomy for the provisioning core.
///
/// `Step` display matches the format persisted into
/// `tenants.onboarding_error`, so an operator reading the registry row and
/// an operator reading the logs see the same text.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A provisioning step failed. Recoverable by re-running the pipeline,
    /// which resumes at this step.
    #[error("Step {step} ({label}): {source}")]
    Step {
        step: u8,
        label: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The requested status transition is not in the allowed set.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: TenantStatus,
        to: TenantStatus,
    },

    /// Activation requested before provisioning completed.
    #[error("onboarding incomplete: step {step} of {total}")]
    OnboardingIncomplete { step: u8, total: u8 },

    /// The migration runner failed or exceeded its time budget.
    #[error("migration tool: {0}")]
    MigrationTool(String),

    /// A tenant database is missing or unopenable.
    #[error("connection routing: {0}")]
    ConnectionRouting(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for pure validation failures the caller must fix; retrying the
    /// same call cannot succeed.
    pub fn is_guard_violation(&self) -> bool {
        matches!(
            self,
            Error::InvalidTransition { .. } | Error::OnboardingIncomplete { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_display_matches_persisted_format() {
        let err = Error::Step {
            step: 3,
            label: "run migrations",
            source: anyhow::anyhow!("no such table: schema_migrations"),
        };
        assert_eq!(
            err.to_string(),
            "Step 3 (run migrations): no such table: schema_migrations"
        );
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = Error::InvalidTransition {
            from: TenantStatus::Pending,
            to: TenantStatus::Active,
        };
        assert_eq!(err.to_string(), "invalid status transition: pending -> active");
        assert!(err.is_guard_violation());
    }

    #[test]
    fn onboarding_incomplete_reports_progress() {
        let err = Error::OnboardingIncomplete { step: 5, total: 8 };
        assert_eq!(err.to_string(), "onboarding incomplete: step 5 of 8");
        assert!(err.is_guard_violation());
    }

    #[test]
    fn step_errors_are_retryable() {
        let err = Error::Step {
            step: 2,
            label: "create database",
            source: anyhow::anyhow!("disk full"),
        };
        assert!(!err.is_guard_violation());
    }
}
