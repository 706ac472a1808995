use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    conn, ensure_exists, get_optional_str, get_patch_str, get_required_str, get_string_list,
    require_admin, write_err,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

fn replace_subjects(
    conn: &Connection,
    teacher_id: &str,
    subject_ids: &[String],
) -> Result<(), HandlerErr> {
    for subject_id in subject_ids {
        ensure_exists(conn, "subjects", subject_id, "subject")?;
    }
    conn.execute(
        "DELETE FROM teacher_subjects WHERE teacher_id = ?",
        [teacher_id],
    )
    .map_err(|e| write_err(e, "db_delete_failed", "teacher_subjects"))?;
    for subject_id in subject_ids {
        conn.execute(
            "INSERT OR IGNORE INTO teacher_subjects(teacher_id, subject_id) VALUES(?, ?)",
            (teacher_id, subject_id),
        )
        .map_err(|e| write_err(e, "db_insert_failed", "teacher_subjects"))?;
    }
    Ok(())
}

fn teachers_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let department_id = get_optional_str(params, "departmentId")?;
    let mut stmt = conn.prepare(
        "SELECT id, full_name, employee_id, department_id, phone
         FROM teachers
         WHERE (?1 IS NULL OR department_id = ?1)
         ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([department_id.as_deref()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut subj_stmt = conn.prepare(
        "SELECT ts.subject_id
         FROM teacher_subjects ts
         JOIN subjects s ON s.id = ts.subject_id
         WHERE ts.teacher_id = ?
         ORDER BY s.code",
    )?;
    let mut teachers = Vec::with_capacity(rows.len());
    for (id, full_name, employee_id, department_id, phone) in rows {
        let subject_ids = subj_stmt
            .query_map([&id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        teachers.push(json!({
            "id": id,
            "fullName": full_name,
            "employeeId": employee_id,
            "departmentId": department_id,
            "phone": phone,
            "subjectIds": subject_ids,
        }));
    }
    Ok(json!({ "teachers": teachers }))
}

fn teachers_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let full_name = get_required_str(params, "fullName")?;
    let employee_id = get_required_str(params, "employeeId")?;
    let department_id = get_optional_str(params, "departmentId")?;
    if let Some(d) = &department_id {
        ensure_exists(conn, "departments", d, "department")?;
    }
    let phone = get_optional_str(params, "phone")?.unwrap_or_default();
    let subject_ids = get_string_list(params, "subjectIds")?;

    let id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO teachers(id, full_name, employee_id, department_id, phone)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &full_name, &employee_id, &department_id, &phone),
    )
    .map_err(|e| write_err(e, "db_insert_failed", "teachers"))?;
    replace_subjects(&tx, &id, &subject_ids)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "teacherId": id }))
}

fn teachers_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let teacher_id = get_required_str(params, "teacherId")?;
    ensure_exists(conn, "teachers", &teacher_id, "teacher")?;
    let patch = params
        .get("patch")
        .ok_or_else(|| HandlerErr::bad_params("missing patch"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Some(full_name) = get_patch_str(patch, "fullName")? {
        let full_name =
            full_name.ok_or_else(|| HandlerErr::bad_params("fullName must not be empty"))?;
        tx.execute(
            "UPDATE teachers SET full_name = ? WHERE id = ?",
            (&full_name, &teacher_id),
        )
        .map_err(|e| write_err(e, "db_update_failed", "teachers"))?;
    }
    if let Some(employee_id) = get_patch_str(patch, "employeeId")? {
        let employee_id =
            employee_id.ok_or_else(|| HandlerErr::bad_params("employeeId must not be empty"))?;
        tx.execute(
            "UPDATE teachers SET employee_id = ? WHERE id = ?",
            (&employee_id, &teacher_id),
        )
        .map_err(|e| write_err(e, "db_update_failed", "teachers"))?;
    }
    if let Some(department_id) = get_patch_str(patch, "departmentId")? {
        if let Some(d) = &department_id {
            ensure_exists(&tx, "departments", d, "department")?;
        }
        tx.execute(
            "UPDATE teachers SET department_id = ? WHERE id = ?",
            (&department_id, &teacher_id),
        )
        .map_err(|e| write_err(e, "db_update_failed", "teachers"))?;
    }
    if let Some(phone) = get_patch_str(patch, "phone")? {
        tx.execute(
            "UPDATE teachers SET phone = ? WHERE id = ?",
            (phone.unwrap_or_default(), &teacher_id),
        )
        .map_err(|e| write_err(e, "db_update_failed", "teachers"))?;
    }
    if patch.get("subjectIds").is_some() {
        let subject_ids = get_string_list(patch, "subjectIds")?;
        replace_subjects(&tx, &teacher_id, &subject_ids)?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn teachers_delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let teacher_id = get_required_str(params, "teacherId")?;
    ensure_exists(conn, "teachers", &teacher_id, "teacher")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Enrollments and attendance outlive the teacher; they just lose the link.
    tx.execute(
        "UPDATE subject_enrollments SET teacher_id = NULL WHERE teacher_id = ?",
        [&teacher_id],
    )
    .map_err(|e| write_err(e, "db_update_failed", "subject_enrollments"))?;
    tx.execute(
        "UPDATE attendance SET marked_by = NULL WHERE marked_by = ?",
        [&teacher_id],
    )
    .map_err(|e| write_err(e, "db_update_failed", "attendance"))?;
    tx.execute(
        "DELETE FROM teacher_subjects WHERE teacher_id = ?",
        [&teacher_id],
    )
    .map_err(|e| write_err(e, "db_delete_failed", "teacher_subjects"))?;
    tx.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id])
        .map_err(|e| write_err(e, "db_delete_failed", "teachers"))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "teachers.list" => teachers_list(state, &req.params),
        "teachers.create" => teachers_create(state, &req.params),
        "teachers.update" => teachers_update(state, &req.params),
        "teachers.delete" => teachers_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
