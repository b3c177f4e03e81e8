use crate::auth::hash_token;
use rusqlite::{params, Connection};

/// Look up the user behind a token hash, stamping `last_used_at` in the same
/// statement.
pub fn verify(conn: &Connection, token_hash: &str) -> anyhow::Result<Option<String>> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "UPDATE auth_tokens SET last_used_at = ?1 WHERE token_hash = ?2 RETURNING user_id",
    )?;
    let mut rows = stmt.query_map(params![now, token_hash], |row| row.get::<_, String>(0))?;
    Ok(rows.next().transpose()?)
}

/// Persist a known plaintext token for a user. Used for the env-seeded
/// bootstrap token; only the hash is stored.
pub fn store(conn: &Connection, token: &str, user_id: &str, label: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT OR REPLACE INTO auth_tokens (token_hash, user_id, label, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![hash_token(token), user_id, label, now],
    )?;
    Ok(())
}

/// Mint a fresh random token for a user and return the plaintext once.
pub fn issue(conn: &Connection, user_id: &str, label: &str) -> anyhow::Result<String> {
    use rand::RngCore;
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    let token: String = buf.iter().map(|b| format!("{:02x}", b)).collect();
    store(conn, &token, user_id, label)?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::apply_schema;

    #[test]
    fn issued_token_verifies_and_touches_last_used() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        let token = issue(&conn, "user-1", "test").unwrap();
        assert_eq!(token.len(), 64);

        let user = verify(&conn, &hash_token(&token)).unwrap();
        assert_eq!(user.as_deref(), Some("user-1"));

        let last_used: Option<String> = conn
            .query_row(
                "SELECT last_used_at FROM auth_tokens WHERE user_id = 'user-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(last_used.is_some());
    }

    #[test]
    fn unknown_token_does_not_verify() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        assert!(verify(&conn, &hash_token("nope")).unwrap().is_none());
    }
}
