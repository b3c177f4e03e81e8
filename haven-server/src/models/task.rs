use crate::models::agent::Agent;
use crate::models::payload::TaskType;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub device_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Value,
    pub status: String,
    pub error: Option<String>,
    pub claimed_at: Option<String>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn row_to_task(row: &Row) -> rusqlite::Result<AgentTask> {
    let payload: String = row.get("payload")?;
    Ok(AgentTask {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        agent_id: row.get("agent_id")?,
        device_id: row.get("device_id")?,
        task_type: row.get("type")?,
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        status: row.get("status")?,
        error: row.get("error")?,
        claimed_at: row.get("claimed_at")?,
        claimed_by: row.get("claimed_by")?,
        lease_expires_at: row.get("lease_expires_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Map a public list-filter value onto the stored task status.
pub fn stored_status_filter(public: &str) -> Option<&'static str> {
    match public {
        "pending" => Some("PENDING"),
        "running" => Some("RUNNING"),
        "done" => Some("DONE"),
        "failed" => Some("ERROR"),
        _ => None,
    }
}

pub fn find_by_id_for_user(
    conn: &Connection,
    id: &str,
    user_id: &str,
) -> anyhow::Result<Option<AgentTask>> {
    let mut stmt = conn.prepare("SELECT * FROM agent_tasks WHERE id = ? AND user_id = ?")?;
    let mut rows = stmt.query_map(params![id, user_id], row_to_task)?;
    Ok(rows.next().transpose()?)
}

pub fn find_for_user(
    conn: &Connection,
    user_id: &str,
    device_id: Option<&str>,
    status: Option<&str>,
    limit: i64,
) -> anyhow::Result<Vec<AgentTask>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM agent_tasks
          WHERE user_id = ?1
            AND (?2 IS NULL OR device_id = ?2)
            AND (?3 IS NULL OR status = ?3)
          ORDER BY created_at DESC, id DESC
          LIMIT ?4",
    )?;
    let rows = stmt.query_map(params![user_id, device_id, status, limit], row_to_task)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Insert a new PENDING task addressed to the agent's device.
pub fn create(
    conn: &Connection,
    user_id: &str,
    agent: &Agent,
    task_type: TaskType,
    payload: &Value,
) -> anyhow::Result<AgentTask> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO agent_tasks (id, user_id, agent_id, device_id, type, payload, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING', ?7, ?7)",
        params![
            id,
            user_id,
            agent.id,
            agent.device_id,
            task_type.as_str(),
            serde_json::to_string(payload)?,
            now
        ],
    )?;
    find_by_id_for_user(conn, &id, user_id)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created task"))
}

/// Hand the oldest PENDING task for this device/agent to the caller.
///
/// The select-and-transition runs as one conditional UPDATE so that two
/// pollers racing for the same task can never both walk away with it: the row
/// flips to RUNNING exactly once and only the winner gets it back from the
/// RETURNING clause.
pub fn claim(
    conn: &Connection,
    user_id: &str,
    device_id: Option<&str>,
    agent_id: Option<&str>,
    lease_secs: i64,
) -> anyhow::Result<Option<AgentTask>> {
    let now = chrono::Utc::now();
    let lease_expires = (now + chrono::Duration::seconds(lease_secs)).to_rfc3339();
    let now = now.to_rfc3339();
    let mut stmt = conn.prepare(
        "UPDATE agent_tasks
            SET status = 'RUNNING',
                claimed_at = ?1,
                claimed_by = COALESCE(?2, device_id),
                lease_expires_at = ?3,
                updated_at = ?1
          WHERE id = (SELECT id FROM agent_tasks
                       WHERE status = 'PENDING'
                         AND user_id = ?4
                         AND ((?2 IS NOT NULL AND device_id = ?2)
                           OR (?5 IS NOT NULL AND agent_id = ?5))
                       ORDER BY created_at ASC, id ASC
                       LIMIT 1)
            AND status = 'PENDING'
        RETURNING *",
    )?;
    let mut rows = stmt.query_map(
        params![now, device_id, lease_expires, user_id, agent_id],
        row_to_task,
    )?;
    Ok(rows.next().transpose()?)
}

/// Terminal transition, guarded: only a RUNNING task can be completed. A
/// zero-row update means the task was never claimed or is already terminal.
pub fn complete(
    conn: &Connection,
    id: &str,
    user_id: &str,
    status: &str,
    error: Option<&str>,
) -> anyhow::Result<Option<AgentTask>> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "UPDATE agent_tasks
            SET status = ?1, error = ?2, lease_expires_at = NULL, updated_at = ?3
          WHERE id = ?4 AND user_id = ?5 AND status = 'RUNNING'
        RETURNING *",
    )?;
    let mut rows = stmt.query_map(params![status, error, now, id, user_id], row_to_task)?;
    Ok(rows.next().transpose()?)
}

/// Reset RUNNING tasks whose lease has lapsed back to PENDING so another
/// poller can pick them up. Returns how many rows were reclaimed.
pub fn release_expired(conn: &Connection) -> anyhow::Result<usize> {
    let now = chrono::Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE agent_tasks
            SET status = 'PENDING', claimed_at = NULL, claimed_by = NULL,
                lease_expires_at = NULL, updated_at = ?1
          WHERE status = 'RUNNING'
            AND lease_expires_at IS NOT NULL
            AND lease_expires_at < ?1",
        params![now],
    )?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::apply_schema;
    use crate::models::agent::{self, RequestActivationRequest};
    use serde_json::json;

    fn setup(conn: &Connection, device_id: &str, user_id: &str) -> Agent {
        let req = RequestActivationRequest {
            device_id: device_id.into(),
            hostname: "box".into(),
            os: "linux".into(),
            arch: None,
            hardware_id: None,
            name: None,
            activation_code: None,
        };
        let pending = agent::create_pending(conn, &req).unwrap();
        agent::activate(conn, &pending, user_id, None).unwrap()
    }

    fn backdate(conn: &Connection, task_id: &str, created_at: &str) {
        conn.execute(
            "UPDATE agent_tasks SET created_at = ?1 WHERE id = ?2",
            params![created_at, task_id],
        )
        .unwrap();
    }

    #[test]
    fn claim_returns_none_when_queue_is_empty() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        setup(&conn, "dev-1", "user-1");

        let claimed = claim(&conn, "user-1", Some("dev-1"), None, 900).unwrap();
        assert!(claimed.is_none());
    }

    #[test]
    fn claim_takes_oldest_pending_first() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        let a = setup(&conn, "dev-1", "user-1");

        let t1 = create(&conn, "user-1", &a, TaskType::Backup, &json!({})).unwrap();
        let t2 = create(&conn, "user-1", &a, TaskType::Backup, &json!({})).unwrap();
        backdate(&conn, &t1.id, "2026-01-01T00:00:00+00:00");
        backdate(&conn, &t2.id, "2026-01-02T00:00:00+00:00");

        let first = claim(&conn, "user-1", Some("dev-1"), None, 900).unwrap().unwrap();
        assert_eq!(first.id, t1.id);
        assert_eq!(first.status, "RUNNING");
        assert_eq!(first.claimed_by.as_deref(), Some("dev-1"));
        assert!(first.claimed_at.is_some());

        let second = claim(&conn, "user-1", Some("dev-1"), None, 900).unwrap().unwrap();
        assert_eq!(second.id, t2.id);

        assert!(claim(&conn, "user-1", Some("dev-1"), None, 900).unwrap().is_none());
    }

    #[test]
    fn claim_by_agent_id_falls_back_to_task_device() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        let a = setup(&conn, "dev-1", "user-1");

        create(&conn, "user-1", &a, TaskType::Restore, &json!({})).unwrap();
        let claimed = claim(&conn, "user-1", None, Some(&a.id), 900).unwrap().unwrap();
        assert_eq!(claimed.claimed_by.as_deref(), Some("dev-1"));
    }

    #[test]
    fn claim_is_scoped_to_the_owner() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        let a = setup(&conn, "dev-1", "user-1");
        create(&conn, "user-1", &a, TaskType::Backup, &json!({})).unwrap();

        assert!(claim(&conn, "user-2", Some("dev-1"), None, 900).unwrap().is_none());
    }

    #[test]
    fn complete_requires_a_running_task() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        let a = setup(&conn, "dev-1", "user-1");
        let task = create(&conn, "user-1", &a, TaskType::Backup, &json!({})).unwrap();

        // Never claimed: the guarded update matches nothing.
        assert!(complete(&conn, &task.id, "user-1", "DONE", None).unwrap().is_none());

        claim(&conn, "user-1", Some("dev-1"), None, 900).unwrap().unwrap();
        let done = complete(&conn, &task.id, "user-1", "DONE", None).unwrap().unwrap();
        assert_eq!(done.status, "DONE");
        assert!(done.lease_expires_at.is_none());

        // Double completion is rejected the same way.
        assert!(complete(&conn, &task.id, "user-1", "ERROR", Some("late")).unwrap().is_none());
    }

    #[test]
    fn complete_records_error_message() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        let a = setup(&conn, "dev-1", "user-1");
        let task = create(&conn, "user-1", &a, TaskType::Backup, &json!({})).unwrap();
        claim(&conn, "user-1", Some("dev-1"), None, 900).unwrap().unwrap();

        let failed = complete(&conn, &task.id, "user-1", "ERROR", Some("disk full"))
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, "ERROR");
        assert_eq!(failed.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn expired_leases_are_reclaimed() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        let a = setup(&conn, "dev-1", "user-1");
        let task = create(&conn, "user-1", &a, TaskType::Backup, &json!({})).unwrap();

        // Negative lease: expired the moment it was claimed.
        claim(&conn, "user-1", Some("dev-1"), None, -1).unwrap().unwrap();
        assert_eq!(release_expired(&conn).unwrap(), 1);

        let reclaimed = find_by_id_for_user(&conn, &task.id, "user-1").unwrap().unwrap();
        assert_eq!(reclaimed.status, "PENDING");
        assert!(reclaimed.claimed_at.is_none());
        assert!(reclaimed.claimed_by.is_none());
        assert!(reclaimed.lease_expires_at.is_none());

        // A healthy lease is left alone.
        claim(&conn, "user-1", Some("dev-1"), None, 900).unwrap().unwrap();
        assert_eq!(release_expired(&conn).unwrap(), 0);
    }

    #[test]
    fn list_filters_by_device_and_status() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        let a = setup(&conn, "dev-1", "user-1");
        let b = setup(&conn, "dev-2", "user-1");

        create(&conn, "user-1", &a, TaskType::Backup, &json!({})).unwrap();
        create(&conn, "user-1", &b, TaskType::Backup, &json!({})).unwrap();
        claim(&conn, "user-1", Some("dev-2"), None, 900).unwrap().unwrap();

        let all = find_for_user(&conn, "user-1", None, None, 50).unwrap();
        assert_eq!(all.len(), 2);

        let dev1 = find_for_user(&conn, "user-1", Some("dev-1"), None, 50).unwrap();
        assert_eq!(dev1.len(), 1);

        let running =
            find_for_user(&conn, "user-1", None, stored_status_filter("running"), 50).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].device_id, "dev-2");
    }
}
