use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskType {
    Backup,
    Restore,
}

impl TaskType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BACKUP" => Some(TaskType::Backup),
            "RESTORE" => Some(TaskType::Restore),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Backup => "BACKUP",
            TaskType::Restore => "RESTORE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Full,
    Incremental,
    Auto,
}

impl BackupMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Some(BackupMode::Full),
            "incremental" => Some(BackupMode::Incremental),
            "auto" => Some(BackupMode::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Full => "full",
            BackupMode::Incremental => "incremental",
            BackupMode::Auto => "auto",
        }
    }
}

/// What CreateTask learned about a BACKUP payload's mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupIntent {
    /// Mode fixed by the caller (full or incremental).
    Fixed(BackupMode),
    /// Caller asked for `auto`; resolve against job history before insert.
    Auto { src_path: Option<String> },
    /// Payload carries no mode semantics at all.
    Unspecified,
}

/// Auto-mode policy: incremental only once a full backup of the same root
/// has completed.
pub fn resolve_auto_mode(has_completed_full: bool) -> BackupMode {
    if has_completed_full {
        BackupMode::Incremental
    } else {
        BackupMode::Full
    }
}

/// Validate a BACKUP payload and classify its mode.
///
/// Mode must parse whenever the payload carries a `mode` key, or whenever
/// `kind == "run_backup"` even without one. Matching is case- and
/// whitespace-insensitive.
pub fn classify_backup_payload(payload: &Value) -> Result<BackupIntent, String> {
    let kind = payload.get("kind").and_then(|v| v.as_str());
    let mode_value = payload.get("mode");

    if mode_value.is_none() && kind != Some("run_backup") {
        return Ok(BackupIntent::Unspecified);
    }

    let raw = match mode_value {
        Some(Value::String(s)) => s.as_str(),
        Some(_) => return Err("mode must be a string".into()),
        None => "",
    };
    let mode = BackupMode::parse(raw).ok_or_else(|| format!("Invalid backup mode: {:?}", raw))?;

    match mode {
        BackupMode::Auto => Ok(BackupIntent::Auto {
            src_path: payload
                .get("src_path")
                .and_then(|v| v.as_str())
                .map(String::from),
        }),
        fixed => Ok(BackupIntent::Fixed(fixed)),
    }
}

/// Write the resolved mode back into the payload, normalized to lowercase.
pub fn set_mode(payload: &mut Value, mode: BackupMode) {
    if let Value::Object(map) = payload {
        map.insert("mode".into(), Value::String(mode.as_str().into()));
    }
}
