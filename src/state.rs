use crate::config::PlatformConfig;
use crate::db::pool::DbPool;
use crate::email::EmailService;
use crate::tenant::cache::TenantCache;
use crate::tenant::router::ConnectionRouter;
use std::sync::Arc;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub config: PlatformConfig,
    pub db: DbPool,
    pub router: ConnectionRouter,
    pub cache: TenantCache,
    pub email: Option<EmailService>,
}

impl AppState {
    pub fn new(
        config: PlatformConfig,
        db: DbPool,
        router: ConnectionRouter,
        cache: TenantCache,
        email: Option<EmailService>,
    ) -> SharedState {
        Arc::new(Self {
            config,
            db,
            router,
            cache,
            email,
        })
    }
}
