use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_level: String,
    /// How long a claimed task stays RUNNING before the reaper may reclaim it.
    pub task_lease_secs: i64,
    pub reaper_interval_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max: u32,
    pub bootstrap_token: Option<String>,
    pub bootstrap_user: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".into()));

        Self {
            port: parse_env("PORT", 3000),
            db_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("haven-server.db")),
            data_dir,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            task_lease_secs: parse_env("TASK_LEASE_SECS", 900),
            reaper_interval_secs: parse_env("REAPER_INTERVAL_SECS", 60),
            rate_limit_window_secs: parse_env("RATE_LIMIT_WINDOW_SECS", 60),
            rate_limit_max: parse_env("RATE_LIMIT_MAX", 30),
            bootstrap_token: std::env::var("AUTH_BOOTSTRAP_TOKEN").ok(),
            bootstrap_user: std::env::var("AUTH_BOOTSTRAP_USER").ok(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
