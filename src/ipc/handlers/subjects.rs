use crate::calc;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    check_semester, conn, ensure_exists, get_optional_bool, get_optional_i64, get_optional_str,
    get_patch_str, get_required_i64, get_required_str, require_admin, write_err,
};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use uuid::Uuid;

fn check_credits(credits: i64) -> Result<i64, HandlerErr> {
    if credits > 0 {
        Ok(credits)
    } else {
        Err(HandlerErr::bad_params("credits must be positive"))
    }
}

fn subjects_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let department_id = get_optional_str(params, "departmentId")?;
    let semester = get_optional_i64(params, "semester")?;
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.code, s.semester, s.department_id, d.code, s.credits, s.is_lab
         FROM subjects s
         JOIN departments d ON d.id = s.department_id
         WHERE (?1 IS NULL OR s.department_id = ?1)
           AND (?2 IS NULL OR s.semester = ?2)
         ORDER BY s.semester, s.code",
    )?;
    let subjects = stmt
        .query_map((department_id.as_deref(), semester), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "semester": r.get::<_, i64>(3)?,
                "departmentId": r.get::<_, String>(4)?,
                "departmentCode": r.get::<_, String>(5)?,
                "credits": r.get::<_, i64>(6)?,
                "isLab": r.get::<_, i64>(7)? != 0,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let name = get_required_str(params, "name")?;
    let code = get_required_str(params, "code")?.to_uppercase();
    let semester = check_semester(get_required_i64(params, "semester")?)?;
    let department_id = get_required_str(params, "departmentId")?;
    ensure_exists(conn, "departments", &department_id, "department")?;
    let credits = check_credits(get_optional_i64(params, "credits")?.unwrap_or(3))?;
    let is_lab = get_optional_bool(params, "isLab")?.unwrap_or(false);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, code, semester, department_id, credits, is_lab)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &name,
            &code,
            semester,
            &department_id,
            credits,
            is_lab as i64,
        ),
    )
    .map_err(|e| write_err(e, "db_insert_failed", "subjects"))?;
    Ok(json!({ "subjectId": id }))
}

fn subjects_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let subject_id = get_required_str(params, "subjectId")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;
    let patch = params
        .get("patch")
        .ok_or_else(|| HandlerErr::bad_params("missing patch"))?;

    let name = get_patch_str(patch, "name")?;
    let code = get_patch_str(patch, "code")?;
    let semester = get_optional_i64(patch, "semester")?
        .map(check_semester)
        .transpose()?;
    let department_id = get_patch_str(patch, "departmentId")?;
    let credits = get_optional_i64(patch, "credits")?
        .map(check_credits)
        .transpose()?;
    let is_lab = get_optional_bool(patch, "isLab")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let update = |sql: &str, value: &dyn rusqlite::ToSql| -> Result<(), HandlerErr> {
        tx.execute(sql, rusqlite::params![value, &subject_id])
            .map(|_| ())
            .map_err(|e| write_err(e, "db_update_failed", "subjects"))
    };

    if let Some(name) = name {
        let name = name.ok_or_else(|| HandlerErr::bad_params("name must not be empty"))?;
        update("UPDATE subjects SET name = ? WHERE id = ?", &name)?;
    }
    if let Some(code) = code {
        let code = code
            .ok_or_else(|| HandlerErr::bad_params("code must not be empty"))?
            .to_uppercase();
        update("UPDATE subjects SET code = ? WHERE id = ?", &code)?;
    }
    if let Some(semester) = semester {
        update("UPDATE subjects SET semester = ? WHERE id = ?", &semester)?;
    }
    if let Some(department_id) = department_id {
        let department_id =
            department_id.ok_or_else(|| HandlerErr::bad_params("departmentId must not be empty"))?;
        ensure_exists(&tx, "departments", &department_id, "department")?;
        update(
            "UPDATE subjects SET department_id = ? WHERE id = ?",
            &department_id,
        )?;
    }
    if let Some(credits) = credits {
        update("UPDATE subjects SET credits = ? WHERE id = ?", &credits)?;
    }

    let mut recomputed = 0;
    if let Some(is_lab) = is_lab {
        update("UPDATE subjects SET is_lab = ? WHERE id = ?", &(is_lab as i64))?;
        // Totals are derived from the subject kind.
        recomputed = calc::refresh_subject_totals(&tx, &subject_id)?;
        tracing::info!(subject_id = %subject_id, is_lab, recomputed, "subject kind changed");
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "recomputedTotals": recomputed }))
}

fn subjects_delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let subject_id = get_required_str(params, "subjectId")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    let delete = |sql: &str, table: &str| -> Result<(), HandlerErr> {
        tx.execute(sql, [&subject_id])
            .map(|_| ())
            .map_err(|e| write_err(e, "db_delete_failed", table))
    };
    delete(
        "DELETE FROM attendance WHERE subject_id = ?",
        "attendance",
    )?;
    delete(
        "DELETE FROM subject_enrollments WHERE subject_id = ?",
        "subject_enrollments",
    )?;
    delete(
        "DELETE FROM teacher_subjects WHERE subject_id = ?",
        "teacher_subjects",
    )?;
    delete(
        "UPDATE timetable_slots SET subject_id = NULL WHERE subject_id = ?",
        "timetable_slots",
    )?;
    for n in 1..=7 {
        let sql = format!(
            "UPDATE timetables SET lecture{n}_subject_id = NULL WHERE lecture{n}_subject_id = ?"
        );
        delete(&sql, "timetables")?;
    }
    delete("DELETE FROM subjects WHERE id = ?", "subjects")?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "subjects.list" => subjects_list(state, &req.params),
        "subjects.create" => subjects_create(state, &req.params),
        "subjects.update" => subjects_update(state, &req.params),
        "subjects.delete" => subjects_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
