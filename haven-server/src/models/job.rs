use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One run recorded by the backup agent. This server only reads these rows;
/// the chunk counters and container checksum are inert data written by the
/// agent out of band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub root_path: Option<String>,
    pub mode: Option<String>,
    pub status: String,
    pub bytes_total: i64,
    pub files_total: i64,
    pub chunks_new: i64,
    pub chunks_reused: i64,
    pub container_checksum: Option<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub created_at: String,
}

/// Dashboard-facing four-state view of the stored history statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "done" => Some(JobState::Done),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    /// The stored statuses that collapse onto this public state.
    pub fn stored_statuses(&self) -> &'static [&'static str] {
        match self {
            JobState::Pending => &["STARTED"],
            JobState::Running => &["PROCESSING"],
            JobState::Done => &["COMPLETED", "SUCCESS"],
            JobState::Failed => &["FAILED", "CANCELED", "ERROR"],
        }
    }
}

/// Collapse a stored history status onto the public model. Anything
/// unrecognized reads as failed rather than hiding the row.
pub fn public_state(stored: &str) -> JobState {
    match stored {
        "STARTED" => JobState::Pending,
        "PROCESSING" => JobState::Running,
        "COMPLETED" | "SUCCESS" => JobState::Done,
        _ => JobState::Failed,
    }
}

/// A job row plus its translated state, as returned by the jobs listing.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: BackupJob,
    pub state: JobState,
}

impl From<BackupJob> for JobView {
    fn from(job: BackupJob) -> Self {
        let state = public_state(&job.status);
        Self { job, state }
    }
}

fn row_to_job(row: &Row) -> rusqlite::Result<BackupJob> {
    Ok(BackupJob {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        device_id: row.get("device_id")?,
        root_path: row.get("root_path")?,
        mode: row.get("mode")?,
        status: row.get("status")?,
        bytes_total: row.get("bytes_total")?,
        files_total: row.get("files_total")?,
        chunks_new: row.get("chunks_new")?,
        chunks_reused: row.get("chunks_reused")?,
        container_checksum: row.get("container_checksum")?,
        error: row.get("error")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        created_at: row.get("created_at")?,
    })
}

pub fn find_for_user(
    conn: &Connection,
    user_id: &str,
    device_id: Option<&str>,
    state: Option<JobState>,
    limit: i64,
) -> anyhow::Result<Vec<BackupJob>> {
    // Stored statuses come from a fixed table, never from the caller.
    let status_clause = match state {
        Some(s) => format!(
            "AND status IN ({})",
            s.stored_statuses()
                .iter()
                .map(|v| format!("'{}'", v))
                .collect::<Vec<_>>()
                .join(",")
        ),
        None => String::new(),
    };
    let sql = format!(
        "SELECT * FROM backup_jobs
          WHERE user_id = ?1 AND (?2 IS NULL OR device_id = ?2) {}
          ORDER BY started_at DESC, id DESC
          LIMIT ?3",
        status_clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![user_id, device_id, limit], row_to_job)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// The most recent successfully completed FULL backup of this root, used by
/// auto-mode resolution at task creation.
pub fn latest_completed_full(
    conn: &Connection,
    user_id: &str,
    device_id: &str,
    root_path: &str,
) -> anyhow::Result<Option<BackupJob>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_jobs
          WHERE user_id = ?1 AND device_id = ?2 AND root_path = ?3
            AND mode = 'FULL' AND status IN ('COMPLETED','SUCCESS')
          ORDER BY started_at DESC
          LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![user_id, device_id, root_path], row_to_job)?;
    Ok(rows.next().transpose()?)
}

/// Fields the external history writer fills in. The server itself never
/// creates job rows outside of tests.
#[derive(Debug, Clone, Default)]
pub struct NewBackupJob {
    pub user_id: String,
    pub device_id: String,
    pub root_path: Option<String>,
    pub mode: Option<String>,
    pub status: String,
    pub bytes_total: i64,
    pub files_total: i64,
    pub chunks_new: i64,
    pub chunks_reused: i64,
    pub container_checksum: Option<String>,
}

pub fn create(conn: &Connection, data: &NewBackupJob) -> anyhow::Result<BackupJob> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO backup_jobs (id, user_id, device_id, root_path, mode, status, bytes_total, files_total, chunks_new, chunks_reused, container_checksum, started_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            id,
            data.user_id,
            data.device_id,
            data.root_path,
            data.mode,
            data.status,
            data.bytes_total,
            data.files_total,
            data.chunks_new,
            data.chunks_reused,
            data.container_checksum,
            now
        ],
    )?;
    let mut stmt = conn.prepare("SELECT * FROM backup_jobs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_job)?;
    rows.next()
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created job"))?
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::apply_schema;

    const STORED: &[&str] = &[
        "STARTED",
        "PROCESSING",
        "COMPLETED",
        "SUCCESS",
        "FAILED",
        "CANCELED",
        "ERROR",
    ];

    #[test]
    fn every_stored_status_maps_to_one_state() {
        for stored in STORED {
            let state = public_state(stored);
            assert!(
                state.stored_statuses().contains(stored),
                "{stored} should round-trip through {state:?}"
            );
        }
    }

    #[test]
    fn filter_expansion_is_the_inverse_image() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Done,
            JobState::Failed,
        ] {
            for stored in state.stored_statuses() {
                assert_eq!(public_state(stored), state);
            }
        }
        // The four expansions cover the stored model exactly once.
        let total: usize = [
            JobState::Pending,
            JobState::Running,
            JobState::Done,
            JobState::Failed,
        ]
        .iter()
        .map(|s| s.stored_statuses().len())
        .sum();
        assert_eq!(total, STORED.len());
    }

    #[test]
    fn state_parse_accepts_public_names_only() {
        assert_eq!(JobState::parse("done"), Some(JobState::Done));
        assert_eq!(JobState::parse("COMPLETED"), None);
        assert_eq!(JobState::parse(""), None);
    }

    fn seed(conn: &Connection, device: &str, root: &str, mode: &str, status: &str) {
        create(
            conn,
            &NewBackupJob {
                user_id: "user-1".into(),
                device_id: device.into(),
                root_path: Some(root.into()),
                mode: Some(mode.into()),
                status: status.into(),
                ..Default::default()
            },
        )
        .unwrap();
    }

    #[test]
    fn latest_completed_full_ignores_partial_matches() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        seed(&conn, "dev-1", "/x", "FULL", "FAILED");
        seed(&conn, "dev-1", "/x", "INCREMENTAL", "COMPLETED");
        seed(&conn, "dev-1", "/y", "FULL", "COMPLETED");
        seed(&conn, "dev-2", "/x", "FULL", "COMPLETED");

        assert!(latest_completed_full(&conn, "user-1", "dev-1", "/x")
            .unwrap()
            .is_none());

        seed(&conn, "dev-1", "/x", "FULL", "SUCCESS");
        let hit = latest_completed_full(&conn, "user-1", "dev-1", "/x").unwrap();
        assert!(hit.is_some());

        // Other users never see it.
        assert!(latest_completed_full(&conn, "user-2", "dev-1", "/x")
            .unwrap()
            .is_none());
    }

    #[test]
    fn listing_filters_by_state_expansion() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        seed(&conn, "dev-1", "/x", "FULL", "COMPLETED");
        seed(&conn, "dev-1", "/x", "FULL", "SUCCESS");
        seed(&conn, "dev-1", "/x", "FULL", "CANCELED");

        let done = find_for_user(&conn, "user-1", None, Some(JobState::Done), 50).unwrap();
        assert_eq!(done.len(), 2);

        let failed = find_for_user(&conn, "user-1", Some("dev-1"), Some(JobState::Failed), 50)
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, "CANCELED");
    }
}
