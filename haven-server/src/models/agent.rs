use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub device_id: String,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub hostname: String,
    pub os: String,
    pub arch: Option<String>,
    pub activation_code: Option<String>,
    pub status: Value, // JSON blob, see AgentStatus
    pub registered_at: Option<String>,
    pub last_seen_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Agent {
    pub fn parsed_status(&self) -> AgentStatus {
        serde_json::from_value(self.status.clone()).unwrap_or_default()
    }

    pub fn is_activated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn hardware_id(&self) -> Option<String> {
        self.parsed_status().hardware_id
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStatus {
    #[serde(default)]
    pub state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentState {
    #[default]
    Pending,
    Active,
}

#[derive(Debug, Deserialize)]
pub struct RequestActivationRequest {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    pub arch: Option<String>,
    pub hardware_id: Option<String>,
    pub name: Option<String>,
    pub activation_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    #[serde(default)]
    pub activation_code: String,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    pub arch: Option<String>,
    pub hardware_fingerprint: Option<String>,
}

fn row_to_agent(row: &Row) -> rusqlite::Result<Agent> {
    let status: String = row.get("status")?;
    Ok(Agent {
        id: row.get("id")?,
        device_id: row.get("device_id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        hostname: row.get("hostname")?,
        os: row.get("os")?,
        arch: row.get("arch")?,
        activation_code: row.get("activation_code")?,
        status: serde_json::from_str(&status).unwrap_or(Value::Null),
        registered_at: row.get("registered_at")?,
        last_seen_at: row.get("last_seen_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Agent>> {
    let mut stmt = conn.prepare("SELECT * FROM agents WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_agent)?;
    Ok(rows.next().transpose()?)
}

pub fn find_by_device_id(conn: &Connection, device_id: &str) -> anyhow::Result<Option<Agent>> {
    let mut stmt = conn.prepare("SELECT * FROM agents WHERE device_id = ?")?;
    let mut rows = stmt.query_map(params![device_id], row_to_agent)?;
    Ok(rows.next().transpose()?)
}

pub fn find_by_code(conn: &Connection, code: &str) -> anyhow::Result<Option<Agent>> {
    let mut stmt = conn.prepare("SELECT * FROM agents WHERE activation_code = ?")?;
    let mut rows = stmt.query_map(params![code], row_to_agent)?;
    Ok(rows.next().transpose()?)
}

pub fn find_by_id_for_user(
    conn: &Connection,
    id: &str,
    user_id: &str,
) -> anyhow::Result<Option<Agent>> {
    let mut stmt = conn.prepare("SELECT * FROM agents WHERE id = ? AND user_id = ?")?;
    let mut rows = stmt.query_map(params![id, user_id], row_to_agent)?;
    Ok(rows.next().transpose()?)
}

pub fn find_by_device_for_user(
    conn: &Connection,
    device_id: &str,
    user_id: &str,
) -> anyhow::Result<Option<Agent>> {
    let mut stmt = conn.prepare("SELECT * FROM agents WHERE device_id = ? AND user_id = ?")?;
    let mut rows = stmt.query_map(params![device_id, user_id], row_to_agent)?;
    Ok(rows.next().transpose()?)
}

pub fn find_all_for_user(conn: &Connection, user_id: &str) -> anyhow::Result<Vec<Agent>> {
    let mut stmt =
        conn.prepare("SELECT * FROM agents WHERE user_id = ? ORDER BY created_at DESC")?;
    let rows = stmt.query_map(params![user_id], row_to_agent)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// 6-digit zero-padded code drawn from a uniform range of one million.
pub fn generate_activation_code() -> String {
    use rand::Rng;
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

/// Insert a fresh PENDING agent with a newly minted activation code,
/// retrying on the (unlikely) code collision.
pub fn create_pending(conn: &Connection, req: &RequestActivationRequest) -> anyhow::Result<Agent> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let status = serde_json::to_string(&AgentStatus {
        state: AgentState::Pending,
        hardware_id: req.hardware_id.clone(),
    })?;

    for _ in 0..5 {
        let code = generate_activation_code();
        let inserted = conn.execute(
            "INSERT INTO agents (id, device_id, user_id, name, hostname, os, arch, activation_code, status, last_seen_at, created_at, updated_at)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?9)",
            params![id, req.device_id, req.name, req.hostname, req.os, req.arch, code, status, now],
        );
        match inserted {
            Ok(_) => {
                return find_by_id(conn, &id)?
                    .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created agent"))
            }
            Err(rusqlite::Error::SqliteFailure(e, ref msg))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
                    && msg.as_deref().is_some_and(|m| m.contains("activation_code")) =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(anyhow::anyhow!("Could not allocate a unique activation code"))
}

/// Refresh mutable metadata on a still-pending agent. The hardware
/// fingerprint is replaced only when the caller supplies one; the stored
/// activation code is kept, or minted if somehow absent.
pub fn refresh_pending(
    conn: &Connection,
    agent: &Agent,
    req: &RequestActivationRequest,
) -> anyhow::Result<Agent> {
    let mut status = agent.parsed_status();
    if let Some(hw) = &req.hardware_id {
        status.hardware_id = Some(hw.clone());
    }
    let code = agent
        .activation_code
        .clone()
        .unwrap_or_else(generate_activation_code);
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE agents
            SET hostname = ?1, os = ?2, arch = COALESCE(?3, arch), name = COALESCE(?4, name),
                activation_code = ?5, status = ?6, last_seen_at = ?7, updated_at = ?7
          WHERE id = ?8",
        params![
            req.hostname,
            req.os,
            req.arch,
            req.name,
            code,
            serde_json::to_string(&status)?,
            now,
            agent.id
        ],
    )?;
    find_by_id(conn, &agent.id)?.ok_or_else(|| anyhow::anyhow!("Agent disappeared"))
}

/// Bind an out-of-band activation code to the device making first contact:
/// the pending row keeps its code but takes over this device's identity and
/// metadata.
pub fn adopt_device(
    conn: &Connection,
    agent: &Agent,
    req: &RequestActivationRequest,
) -> anyhow::Result<Agent> {
    let mut status = agent.parsed_status();
    if let Some(hw) = &req.hardware_id {
        status.hardware_id = Some(hw.clone());
    }
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE agents
            SET device_id = ?1, hostname = ?2, os = ?3, arch = COALESCE(?4, arch),
                name = COALESCE(?5, name), status = ?6, last_seen_at = ?7, updated_at = ?7
          WHERE id = ?8",
        params![
            req.device_id,
            req.hostname,
            req.os,
            req.arch,
            req.name,
            serde_json::to_string(&status)?,
            now,
            agent.id
        ],
    )?;
    find_by_id(conn, &agent.id)?.ok_or_else(|| anyhow::anyhow!("Agent disappeared"))
}

/// Bind the agent to a user after a successful code redemption. Stamps
/// `registered_at` only the first time; the hardware fingerprint recorded
/// during request-activation is preserved.
pub fn activate(
    conn: &Connection,
    agent: &Agent,
    user_id: &str,
    name: Option<&str>,
) -> anyhow::Result<Agent> {
    let mut status = agent.parsed_status();
    status.state = AgentState::Active;
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE agents
            SET user_id = ?1, name = COALESCE(?2, name), status = ?3,
                registered_at = COALESCE(registered_at, ?4), last_seen_at = ?4, updated_at = ?4
          WHERE id = ?5",
        params![user_id, name, serde_json::to_string(&status)?, now, agent.id],
    )?;
    find_by_id(conn, &agent.id)?.ok_or_else(|| anyhow::anyhow!("Agent disappeared"))
}

/// Authenticated heartbeat against an existing row: re-bind to the caller
/// and refresh mutable metadata plus `last_seen_at`.
pub fn register_heartbeat(
    conn: &Connection,
    agent: &Agent,
    user_id: &str,
    req: &RegisterAgentRequest,
) -> anyhow::Result<Agent> {
    let mut status = agent.parsed_status();
    status.state = AgentState::Active;
    if let Some(hw) = &req.hardware_fingerprint {
        status.hardware_id = Some(hw.clone());
    }
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE agents
            SET user_id = ?1, hostname = ?2, os = ?3, arch = COALESCE(?4, arch), status = ?5,
                registered_at = COALESCE(registered_at, ?6), last_seen_at = ?6, updated_at = ?6
          WHERE id = ?7",
        params![
            user_id,
            req.hostname,
            req.os,
            req.arch,
            serde_json::to_string(&status)?,
            now,
            agent.id
        ],
    )?;
    find_by_id(conn, &agent.id)?.ok_or_else(|| anyhow::anyhow!("Agent disappeared"))
}

/// Insert a new agent already bound to the caller. This authenticated path
/// needs no activation code.
pub fn insert_registered(
    conn: &Connection,
    user_id: &str,
    req: &RegisterAgentRequest,
) -> anyhow::Result<Agent> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let status = serde_json::to_string(&AgentStatus {
        state: AgentState::Active,
        hardware_id: req.hardware_fingerprint.clone(),
    })?;
    conn.execute(
        "INSERT INTO agents (id, device_id, user_id, name, hostname, os, arch, activation_code, status, registered_at, last_seen_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, NULL, ?7, ?8, ?8, ?8, ?8)",
        params![id, req.device_id, user_id, req.hostname, req.os, req.arch, status, now],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created agent"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::apply_schema;

    fn request(device_id: &str) -> RequestActivationRequest {
        RequestActivationRequest {
            device_id: device_id.into(),
            hostname: "box".into(),
            os: "linux".into(),
            arch: Some("x86_64".into()),
            hardware_id: None,
            name: None,
            activation_code: None,
        }
    }

    #[test]
    fn activation_codes_are_six_digits() {
        for _ in 0..100 {
            let code = generate_activation_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn create_then_activate_binds_user_once() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        let agent = create_pending(&conn, &request("dev-1")).unwrap();
        assert!(!agent.is_activated());
        assert!(agent.activation_code.is_some());
        assert_eq!(agent.parsed_status().state, AgentState::Pending);

        let activated = activate(&conn, &agent, "user-1", Some("laptop")).unwrap();
        assert_eq!(activated.user_id.as_deref(), Some("user-1"));
        assert_eq!(activated.name.as_deref(), Some("laptop"));
        assert_eq!(activated.parsed_status().state, AgentState::Active);
        let registered_at = activated.registered_at.clone().unwrap();

        // Re-activation keeps the original registration stamp.
        let again = activate(&conn, &activated, "user-1", None).unwrap();
        assert_eq!(again.registered_at.as_deref(), Some(registered_at.as_str()));
    }

    #[test]
    fn refresh_preserves_hardware_id_unless_supplied() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        let mut req = request("dev-2");
        req.hardware_id = Some("hw-original".into());
        let agent = create_pending(&conn, &req).unwrap();
        let code = agent.activation_code.clone();

        let mut refresh = request("dev-2");
        refresh.hostname = "renamed".into();
        let refreshed = refresh_pending(&conn, &agent, &refresh).unwrap();
        assert_eq!(refreshed.hostname, "renamed");
        assert_eq!(refreshed.hardware_id().as_deref(), Some("hw-original"));
        assert_eq!(refreshed.activation_code, code);

        refresh.hardware_id = Some("hw-new".into());
        let replaced = refresh_pending(&conn, &refreshed, &refresh).unwrap();
        assert_eq!(replaced.hardware_id().as_deref(), Some("hw-new"));
    }

    #[test]
    fn adopt_takes_over_device_identity() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        let seeded = create_pending(&conn, &request("placeholder")).unwrap();
        let adopted = adopt_device(&conn, &seeded, &request("dev-3")).unwrap();
        assert_eq!(adopted.device_id, "dev-3");
        assert_eq!(adopted.activation_code, seeded.activation_code);
    }
}
