use crate::calc;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{account, check_semester, conn, get_optional_i64, get_required_str};
use crate::ipc::types::{Account, AppState, Request};
use serde_json::{json, Value};
use uuid::Uuid;

/// Students only ever see their own results.
fn target_student(state: &AppState, params: &Value) -> Result<String, HandlerErr> {
    match account(state)? {
        Account::Student { student_id } => {
            if let Some(requested) = params.get("studentId").and_then(|v| v.as_str()) {
                if requested != student_id {
                    return Err(HandlerErr::forbidden("students may only view their own results"));
                }
            }
            Ok(student_id.clone())
        }
        _ => get_required_str(params, "studentId"),
    }
}

fn performance_student(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = target_student(state, params)?;
    let semester = get_optional_i64(params, "semester")?
        .map(check_semester)
        .transpose()?;
    let conn = conn(state)?;
    let report = calc::compute_student_performance(conn, &student_id, semester)?;
    serde_json::to_value(report).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn performance_snapshot(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = target_student(state, params)?;
    let semester = get_optional_i64(params, "semester")?
        .map(check_semester)
        .transpose()?;
    let conn = conn(state)?;
    let report = calc::compute_student_performance(conn, &student_id, semester)?;
    let created_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO semester_performances(id, student_id, semester, sgpa, created_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id, semester) DO UPDATE SET
           sgpa = excluded.sgpa,
           created_at = excluded.created_at",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            report.semester,
            report.sgpa,
            &created_at,
        ),
    )
    .map_err(|e| HandlerErr::db_write("db_insert_failed", e, "semester_performances"))?;
    tracing::debug!(student_id = %student_id, semester = report.semester, sgpa = report.sgpa, "sgpa snapshot");
    Ok(json!({
        "studentId": student_id,
        "semester": report.semester,
        "sgpa": report.sgpa,
        "createdAt": created_at,
    }))
}

fn performance_history(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = target_student(state, params)?;
    let conn = conn(state)?;
    let mut stmt = conn.prepare(
        "SELECT semester, sgpa, created_at
         FROM semester_performances
         WHERE student_id = ?
         ORDER BY semester",
    )?;
    let history = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "semester": r.get::<_, i64>(0)?,
                "sgpa": r.get::<_, f64>(1)?,
                "createdAt": r.get::<_, String>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "studentId": student_id, "history": history }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "performance.student" => performance_student(state, &req.params),
        "performance.snapshot" => performance_snapshot(state, &req.params),
        "performance.history" => performance_history(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
