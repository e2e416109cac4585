use crate::db::pool::DbPool;
use crate::error::Error;
use crate::tenant::{self, cache::TenantCache, TenantRecord, TenantStatus, TOTAL_STEPS};

/// Operator-facing transition table.
pub fn allowed_transitions(from: TenantStatus) -> &'static [TenantStatus] {
    match from {
        TenantStatus::Pending => &[TenantStatus::Cancelled],
        TenantStatus::Active => &[TenantStatus::Suspended, TenantStatus::Cancelled],
        TenantStatus::Suspended => &[TenantStatus::Active, TenantStatus::Cancelled],
        TenantStatus::Cancelled => &[TenantStatus::Active],
    }
}

/// Apply an operator-requested status transition.
///
/// Re-activation (target `active`) additionally requires completed
/// onboarding even where the raw table allows the transition. Activation of
/// a `pending` tenant is not an operator action at all — that is the
/// pipeline's completion path, [`activate_provisioned`].
pub fn change_status(
    db: &DbPool,
    cache: &TenantCache,
    tenant: &TenantRecord,
    target: TenantStatus,
) -> Result<TenantRecord, Error> {
    if !allowed_transitions(tenant.status).contains(&target) {
        return Err(Error::InvalidTransition {
            from: tenant.status,
            to: target,
        });
    }
    if target == TenantStatus::Active && tenant.onboarding_step != TOTAL_STEPS {
        return Err(Error::OnboardingIncomplete {
            step: tenant.onboarding_step,
            total: TOTAL_STEPS,
        });
    }

    tenant::set_status(db, tenant.id, target)?;
    cache.forget(&tenant.subdomain);
    tracing::info!(
        "tenant {} status {} -> {}",
        tenant.subdomain,
        tenant.status,
        target
    );

    let mut updated = tenant.clone();
    updated.status = target;
    Ok(updated)
}

/// Provisioning completion path: flip a pending tenant to active once every
/// infrastructure step before activation has run.
pub fn activate_provisioned(
    db: &DbPool,
    cache: &TenantCache,
    tenant: &TenantRecord,
) -> Result<(), Error> {
    if tenant.status != TenantStatus::Pending {
        return Err(Error::InvalidTransition {
            from: tenant.status,
            to: TenantStatus::Active,
        });
    }
    if tenant.onboarding_step != provisioner_activation_floor() {
        return Err(Error::OnboardingIncomplete {
            step: tenant.onboarding_step,
            total: TOTAL_STEPS,
        });
    }

    tenant::set_status(db, tenant.id, TenantStatus::Active)?;
    cache.forget(&tenant.subdomain);
    tracing::info!("tenant {} activated", tenant.subdomain);
    Ok(())
}

/// Steps that must be complete before the activation step itself runs
/// (everything except activation and the welcome notice).
fn provisioner_activation_floor() -> u8 {
    TOTAL_STEPS - 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::open_temp_registry;
    use crate::tenant::NewTenant;

    fn setup(status: TenantStatus, step: u8) -> (DbPool, crate::db::testutil::TempRegistry, TenantRecord) {
        let (db, tmp) = open_temp_registry();
        let t = tenant::register(
            &db,
            NewTenant {
                subdomain: "acme",
                admin_email: "a@x.com",
                plan: "free",
                timezone: "UTC",
                company_name: "Acme",
                primary_color: "#1f6feb",
            },
        )
        .unwrap();
        if step > 0 {
            tenant::update_step(&db, t.id, step).unwrap();
        }
        tenant::set_status(&db, t.id, status).unwrap();
        let t = tenant::fetch(&db, t.id).unwrap().unwrap();
        (db, tmp, t)
    }

    #[test]
    fn pending_cannot_activate_via_operator_path() {
        let (db, _tmp, t) = setup(TenantStatus::Pending, 0);
        let cache = TenantCache::new(60);
        let err = change_status(&db, &cache, &t, TenantStatus::Active).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn active_can_suspend() {
        let (db, _tmp, t) = setup(TenantStatus::Active, 8);
        let cache = TenantCache::new(60);
        let updated = change_status(&db, &cache, &t, TenantStatus::Suspended).unwrap();
        assert_eq!(updated.status, TenantStatus::Suspended);
        let stored = tenant::fetch(&db, t.id).unwrap().unwrap();
        assert_eq!(stored.status, TenantStatus::Suspended);
    }

    #[test]
    fn suspended_cannot_return_to_pending() {
        let (db, _tmp, t) = setup(TenantStatus::Suspended, 8);
        let cache = TenantCache::new(60);
        let err = change_status(&db, &cache, &t, TenantStatus::Pending).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn reactivation_requires_completed_onboarding() {
        let (db, _tmp, t) = setup(TenantStatus::Suspended, 6);
        let cache = TenantCache::new(60);
        let err = change_status(&db, &cache, &t, TenantStatus::Active).unwrap_err();
        assert!(matches!(
            err,
            Error::OnboardingIncomplete { step: 6, total: 8 }
        ));
    }

    #[test]
    fn suspended_reactivates_when_complete() {
        let (db, _tmp, t) = setup(TenantStatus::Suspended, 8);
        let cache = TenantCache::new(60);
        let updated = change_status(&db, &cache, &t, TenantStatus::Active).unwrap();
        assert_eq!(updated.status, TenantStatus::Active);
    }

    #[test]
    fn cancelled_can_reactivate_when_complete() {
        let (db, _tmp, t) = setup(TenantStatus::Cancelled, 8);
        let cache = TenantCache::new(60);
        assert!(change_status(&db, &cache, &t, TenantStatus::Active).is_ok());
    }

    #[test]
    fn status_change_invalidates_cache_entry() {
        let (db, _tmp, t) = setup(TenantStatus::Active, 8);
        let cache = TenantCache::new(60);
        // Prime the cache, then transition; next lookup must hit the producer.
        let mut calls = 0;
        cache
            .remember("acme", || {
                calls += 1;
                Ok(Some(t.clone()))
            })
            .unwrap();
        change_status(&db, &cache, &t, TenantStatus::Suspended).unwrap();
        cache
            .remember("acme", || {
                calls += 1;
                tenant::fetch_by_subdomain(&db, "acme")
            })
            .unwrap();
        assert_eq!(calls, 2);
    }

    #[test]
    fn pipeline_activation_requires_pending_and_floor() {
        let (db, _tmp, t) = setup(TenantStatus::Pending, 6);
        let cache = TenantCache::new(60);
        activate_provisioned(&db, &cache, &t).unwrap();
        let stored = tenant::fetch(&db, t.id).unwrap().unwrap();
        assert_eq!(stored.status, TenantStatus::Active);
    }

    #[test]
    fn pipeline_activation_rejects_partial_onboarding() {
        let (db, _tmp, t) = setup(TenantStatus::Pending, 4);
        let cache = TenantCache::new(60);
        let err = activate_provisioned(&db, &cache, &t).unwrap_err();
        assert!(matches!(err, Error::OnboardingIncomplete { step: 4, .. }));
    }

    #[test]
    fn pipeline_activation_rejects_non_pending() {
        let (db, _tmp, t) = setup(TenantStatus::Suspended, 6);
        let cache = TenantCache::new(60);
        let err = activate_provisioned(&db, &cache, &t).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }
}
