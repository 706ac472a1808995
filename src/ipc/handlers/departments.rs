use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    conn, ensure_exists, get_optional_str, get_patch_str, get_required_str, require_admin,
    write_err,
};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use uuid::Uuid;

fn departments_list(state: &mut AppState) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let mut stmt = conn.prepare(
        "SELECT d.id, d.name, d.code,
                (SELECT COUNT(*) FROM subjects s WHERE s.department_id = d.id),
                (SELECT COUNT(*) FROM students st WHERE st.department_id = d.id)
         FROM departments d
         ORDER BY d.code",
    )?;
    let departments = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "subjectCount": r.get::<_, i64>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "departments": departments }))
}

fn departments_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let name = get_required_str(params, "name")?;
    let code = get_required_str(params, "code")?.to_uppercase();
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO departments(id, name, code) VALUES(?, ?, ?)",
        (&id, &name, &code),
    )
    .map_err(|e| write_err(e, "db_insert_failed", "departments"))?;
    Ok(json!({ "departmentId": id }))
}

fn departments_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let department_id = get_required_str(params, "departmentId")?;
    ensure_exists(conn, "departments", &department_id, "department")?;
    let patch = params
        .get("patch")
        .ok_or_else(|| HandlerErr::bad_params("missing patch"))?;

    if let Some(name) = get_patch_str(patch, "name")? {
        let name = name.ok_or_else(|| HandlerErr::bad_params("name must not be empty"))?;
        conn.execute(
            "UPDATE departments SET name = ? WHERE id = ?",
            (&name, &department_id),
        )
        .map_err(|e| write_err(e, "db_update_failed", "departments"))?;
    }
    if let Some(code) = get_patch_str(patch, "code")? {
        let code = code
            .ok_or_else(|| HandlerErr::bad_params("code must not be empty"))?
            .to_uppercase();
        conn.execute(
            "UPDATE departments SET code = ? WHERE id = ?",
            (&code, &department_id),
        )
        .map_err(|e| write_err(e, "db_update_failed", "departments"))?;
    }
    Ok(json!({ "ok": true }))
}

fn departments_delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let department_id = get_required_str(params, "departmentId")?;
    ensure_exists(conn, "departments", &department_id, "department")?;

    let in_use: i64 = conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM subjects WHERE department_id = ?1)
          + (SELECT COUNT(*) FROM teachers WHERE department_id = ?1)
          + (SELECT COUNT(*) FROM students WHERE department_id = ?1)",
        [&department_id],
        |r| r.get(0),
    )?;
    if in_use > 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: "department still has subjects, teachers or students".into(),
            details: Some(json!({ "references": in_use })),
        });
    }
    conn.execute("DELETE FROM departments WHERE id = ?", [&department_id])
        .map_err(|e| write_err(e, "db_delete_failed", "departments"))?;
    Ok(json!({ "ok": true }))
}

fn degrees_list(state: &mut AppState) -> Result<Value, HandlerErr> {
    let conn = conn(state)?;
    let mut stmt =
        conn.prepare("SELECT id, name, code, university_name FROM degrees ORDER BY name")?;
    let degrees = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "universityName": r.get::<_, String>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "degrees": degrees }))
}

fn degrees_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_admin(state)?;
    let conn = conn(state)?;
    let name = get_required_str(params, "name")?;
    let code = get_optional_str(params, "code")?.unwrap_or_default();
    let university_name = get_optional_str(params, "universityName")?.unwrap_or_default();
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO degrees(id, name, code, university_name) VALUES(?, ?, ?, ?)",
        (&id, &name, &code, &university_name),
    )
    .map_err(|e| write_err(e, "db_insert_failed", "degrees"))?;
    Ok(json!({ "degreeId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "departments.list" => departments_list(state),
        "departments.create" => departments_create(state, &req.params),
        "departments.update" => departments_update(state, &req.params),
        "departments.delete" => departments_delete(state, &req.params),
        "degrees.list" => degrees_list(state),
        "degrees.create" => degrees_create(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
