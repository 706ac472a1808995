use crate::enrollment::{self, BatchFilter};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    account, check_semester, conn, ensure_exists, get_optional_i64, get_optional_str,
    get_required_str, require_admin,
};
use crate::ipc::types::{Account, AppState, Request};
use serde_json::{json, Value};

fn enrollment_resolve(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let counts = enrollment::resolve_student(&tx, &student_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "created": counts.created, "updated": counts.updated }))
}

fn enrollment_batch(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let filter = BatchFilter {
        semester: get_optional_i64(params, "semester")?
            .map(check_semester)
            .transpose()?,
        department_code: get_optional_str(params, "departmentCode")?.map(|c| c.to_uppercase()),
    };
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let report = enrollment::resolve_batch(&tx, &filter)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    serde_json::to_value(report).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn enrollment_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = match account(state)? {
        Account::Student { student_id } => student_id.clone(),
        _ => get_required_str(params, "studentId")?,
    };
    let conn = conn(state)?;
    ensure_exists(conn, "students", &student_id, "student")?;

    let mut stmt = conn.prepare(
        "SELECT e.id, s.id, s.code, s.name, s.semester, s.is_lab, e.teacher_id, t.full_name
         FROM subject_enrollments e
         JOIN subjects s ON s.id = e.subject_id
         LEFT JOIN teachers t ON t.id = e.teacher_id
         WHERE e.student_id = ?
         ORDER BY s.semester, s.code",
    )?;
    let enrollments = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "enrollmentId": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "subjectCode": r.get::<_, String>(2)?,
                "subjectName": r.get::<_, String>(3)?,
                "semester": r.get::<_, i64>(4)?,
                "isLab": r.get::<_, i64>(5)? != 0,
                "teacherId": r.get::<_, Option<String>>(6)?,
                "teacherName": r.get::<_, Option<String>>(7)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "studentId": student_id, "enrollments": enrollments }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "enrollment.resolve" => enrollment_resolve(state, &req.params),
        "enrollment.batch" => enrollment_batch(state, &req.params),
        "enrollment.list" => enrollment_list(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
