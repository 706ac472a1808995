use crate::ipc::error::HandlerErr;
use crate::ipc::types::{Account, AppState};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

pub fn conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn account(state: &AppState) -> Result<&Account, HandlerErr> {
    state
        .account
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_session", "open a session first"))
}

pub fn require_admin(state: &AppState) -> Result<(), HandlerErr> {
    match account(state)? {
        Account::Admin => Ok(()),
        _ => Err(HandlerErr::forbidden("admin only")),
    }
}

/// Admin or teacher. Returns the teacher id when acting as a teacher.
pub fn require_staff(state: &AppState) -> Result<Option<&str>, HandlerErr> {
    match account(state)? {
        Account::Admin => Ok(None),
        Account::Teacher { teacher_id } => Ok(Some(teacher_id.as_str())),
        Account::Student { .. } => Err(HandlerErr::forbidden("staff only")),
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Absent, null and blank all read as `None`.
pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(HandlerErr::bad_params(format!(
            "{} must be string or null",
            key
        ))),
    }
}

pub fn get_optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    get_optional_i64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

/// Tri-state string for patches: absent keeps, null/blank clears.
pub fn get_patch_str(params: &Value, key: &str) -> Result<Option<Option<String>>, HandlerErr> {
    if params.get(key).is_none() {
        return Ok(None);
    }
    Ok(Some(get_optional_str(params, key)?))
}

pub fn check_semester(semester: i64) -> Result<i64, HandlerErr> {
    if (1..=8).contains(&semester) {
        Ok(semester)
    } else {
        Err(HandlerErr::bad_params("semester must be between 1 and 8"))
    }
}

pub fn get_string_list(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain strings", key)))
            })
            .collect(),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be an array", key))),
    }
}

/// `table` is always a fixed identifier from the caller, never user input.
pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    Ok(conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub fn ensure_exists(
    conn: &Connection,
    table: &str,
    id: &str,
    what: &str,
) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(format!("{} not found", what)))
    }
}

/// Maps a UNIQUE violation to `conflict`, anything else to `code`.
pub fn write_err(e: rusqlite::Error, code: &'static str, table: &str) -> HandlerErr {
    if let rusqlite::Error::SqliteFailure(f, _) = &e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation
            && e.to_string().contains("UNIQUE")
        {
            return HandlerErr {
                code: "conflict",
                message: e.to_string(),
                details: Some(serde_json::json!({ "table": table })),
            };
        }
    }
    HandlerErr::db_write(code, e, table)
}
