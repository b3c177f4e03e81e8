use crate::db::connection::DbPool;
use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
  id TEXT PRIMARY KEY,
  device_id TEXT NOT NULL UNIQUE,
  user_id TEXT,
  name TEXT,
  hostname TEXT NOT NULL,
  os TEXT NOT NULL,
  arch TEXT,
  activation_code TEXT UNIQUE,
  status TEXT NOT NULL DEFAULT '{}',
  registered_at TEXT,
  last_seen_at TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS agent_tasks (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
  device_id TEXT NOT NULL,
  type TEXT NOT NULL CHECK(type IN ('BACKUP','RESTORE')),
  payload TEXT NOT NULL DEFAULT '{}',
  status TEXT NOT NULL DEFAULT 'PENDING' CHECK(status IN ('PENDING','RUNNING','DONE','ERROR')),
  error TEXT,
  claimed_at TEXT,
  claimed_by TEXT,
  lease_expires_at TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_agent_tasks_claim ON agent_tasks(user_id, status, created_at);
CREATE INDEX IF NOT EXISTS idx_agent_tasks_device ON agent_tasks(device_id);

CREATE TABLE IF NOT EXISTS backup_jobs (
  id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  device_id TEXT NOT NULL,
  root_path TEXT,
  mode TEXT CHECK(mode IN ('FULL','INCREMENTAL')),
  status TEXT NOT NULL CHECK(status IN ('STARTED','PROCESSING','COMPLETED','SUCCESS','FAILED','CANCELED','ERROR')),
  bytes_total INTEGER NOT NULL DEFAULT 0,
  files_total INTEGER NOT NULL DEFAULT 0,
  chunks_new INTEGER NOT NULL DEFAULT 0,
  chunks_reused INTEGER NOT NULL DEFAULT 0,
  container_checksum TEXT,
  error TEXT,
  started_at TEXT NOT NULL DEFAULT (datetime('now')),
  finished_at TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_backup_jobs_history ON backup_jobs(user_id, device_id, root_path, started_at DESC);

CREATE TABLE IF NOT EXISTS auth_tokens (
  token_hash TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  label TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  last_used_at TEXT
);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");
    let conn = pool.get()?;
    apply_schema(&conn)?;
    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

pub fn apply_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
