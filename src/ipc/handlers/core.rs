use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{conn, ensure_exists, get_required_str};
use crate::ipc::types::{Account, AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn health(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "session": state.account,
    }))
}

fn workspace_select(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let path = params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .ok_or_else(|| HandlerErr::bad_params("missing params.path"))?;

    let conn = db::open_db(&path)
        .map_err(|e| HandlerErr::new("db_open_failed", format!("{e:?}")))?;
    tracing::info!(workspace = %path.display(), "workspace opened");
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    // Identities belong to the previous workspace.
    state.account = None;
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

fn session_open(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let role = get_required_str(params, "role")?;
    let account = {
        let conn = conn(state)?;
        match role.as_str() {
            "admin" => Account::Admin,
            "teacher" => {
                let teacher_id = get_required_str(params, "teacherId")?;
                ensure_exists(conn, "teachers", &teacher_id, "teacher")?;
                Account::Teacher { teacher_id }
            }
            "student" => {
                let student_id = get_required_str(params, "studentId")?;
                ensure_exists(conn, "students", &student_id, "student")?;
                Account::Student { student_id }
            }
            _ => {
                return Err(HandlerErr::bad_params(
                    "role must be one of: admin, teacher, student",
                ))
            }
        }
    };
    tracing::info!(role = %role, "session opened");
    state.account = Some(account.clone());
    Ok(json!({ "session": account }))
}

fn session_current(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "session": state.account }))
}

fn session_close(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    state.account = None;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "health" => health(state),
        "workspace.select" => workspace_select(state, &req.params),
        "session.open" => session_open(state, &req.params),
        "session.current" => session_current(state),
        "session.close" => session_close(state),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
