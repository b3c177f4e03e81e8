use crate::auth::rate_limit::FixedWindowLimiter;
use crate::config::AppConfig;
use crate::db::connection::DbPool;
use std::time::Duration;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub limiter: FixedWindowLimiter,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig) -> Self {
        let limiter = FixedWindowLimiter::new(
            config.rate_limit_max,
            Duration::from_secs(config.rate_limit_window_secs),
        );
        Self { db, config, limiter }
    }
}
