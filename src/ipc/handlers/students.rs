use crate::enrollment::{self, EnrollmentCounts};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    check_semester, conn, ensure_exists, get_optional_i64, get_optional_str, get_patch_str,
    get_required_i64, get_required_str, require_staff, write_err,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

fn parse_birth_date(raw: Option<String>) -> Result<Option<String>, HandlerErr> {
    match raw {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map(|d| Some(d.format("%Y-%m-%d").to_string()))
            .map_err(|_| HandlerErr::bad_params("dateOfBirth must be YYYY-MM-DD")),
    }
}

fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Runs the resolver for a freshly saved student when auto enrollment is on.
fn auto_enroll(conn: &Connection, student_id: &str) -> Result<EnrollmentCounts, HandlerErr> {
    if !setup::auto_enroll_on_save(conn)? {
        return Ok(EnrollmentCounts::default());
    }
    Ok(enrollment::resolve_student(conn, student_id)?)
}

fn students_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_staff(state)?;
    let conn = conn(state)?;
    let department_id = get_optional_str(params, "departmentId")?;
    let degree_id = get_optional_str(params, "degreeId")?;
    let section = get_optional_str(params, "section")?;
    let semester = get_optional_i64(params, "semester")?;

    let mut stmt = conn.prepare(
        "SELECT s.id, s.full_name, s.roll_number, s.department_id, d.code, s.degree_id,
                s.section, s.semester, s.phone, s.date_of_birth, s.address,
                (SELECT COUNT(*) FROM subject_enrollments e WHERE e.student_id = s.id)
         FROM students s
         LEFT JOIN departments d ON d.id = s.department_id
         WHERE (?1 IS NULL OR s.department_id = ?1)
           AND (?2 IS NULL OR s.degree_id = ?2)
           AND (?3 IS NULL OR s.section = ?3 COLLATE NOCASE)
           AND (?4 IS NULL OR s.semester = ?4)
         ORDER BY s.roll_number",
    )?;
    let students = stmt
        .query_map(
            (
                department_id.as_deref(),
                degree_id.as_deref(),
                section.as_deref(),
                semester,
            ),
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "fullName": r.get::<_, String>(1)?,
                    "rollNumber": r.get::<_, String>(2)?,
                    "departmentId": r.get::<_, Option<String>>(3)?,
                    "departmentCode": r.get::<_, Option<String>>(4)?,
                    "degreeId": r.get::<_, Option<String>>(5)?,
                    "section": r.get::<_, Option<String>>(6)?,
                    "semester": r.get::<_, i64>(7)?,
                    "phone": r.get::<_, String>(8)?,
                    "dateOfBirth": r.get::<_, Option<String>>(9)?,
                    "address": r.get::<_, String>(10)?,
                    "enrollmentCount": r.get::<_, i64>(11)?,
                }))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

fn students_create(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_staff(state)?;
    let conn = conn(state)?;
    let full_name = get_required_str(params, "fullName")?;
    let roll_number = get_required_str(params, "rollNumber")?.to_uppercase();
    let semester = check_semester(get_required_i64(params, "semester")?)?;
    let department_id = get_optional_str(params, "departmentId")?;
    if let Some(d) = &department_id {
        ensure_exists(conn, "departments", d, "department")?;
    }
    let degree_id = get_optional_str(params, "degreeId")?;
    if let Some(d) = &degree_id {
        ensure_exists(conn, "degrees", d, "degree")?;
    }
    let section = get_optional_str(params, "section")?;
    let phone = get_optional_str(params, "phone")?.unwrap_or_default();
    let date_of_birth = parse_birth_date(get_optional_str(params, "dateOfBirth")?)?;
    let address = get_optional_str(params, "address")?.unwrap_or_default();

    let id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO students(
            id, full_name, roll_number, department_id, degree_id, section, semester,
            phone, date_of_birth, address, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &full_name,
            &roll_number,
            &department_id,
            &degree_id,
            &section,
            semester,
            &phone,
            &date_of_birth,
            &address,
            now_stamp(),
        ),
    )
    .map_err(|e| write_err(e, "db_insert_failed", "students"))?;
    let counts = auto_enroll(&tx, &id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "studentId": id, "enrollment": counts }))
}

fn students_update(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_staff(state)?;
    let conn = conn(state)?;
    let student_id = get_required_str(params, "studentId")?;
    ensure_exists(conn, "students", &student_id, "student")?;
    let patch = params
        .get("patch")
        .ok_or_else(|| HandlerErr::bad_params("missing patch"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let update = |sql: &str, value: &dyn rusqlite::ToSql| -> Result<(), HandlerErr> {
        tx.execute(sql, rusqlite::params![value, &student_id])
            .map(|_| ())
            .map_err(|e| write_err(e, "db_update_failed", "students"))
    };

    if let Some(full_name) = get_patch_str(patch, "fullName")? {
        let full_name =
            full_name.ok_or_else(|| HandlerErr::bad_params("fullName must not be empty"))?;
        update("UPDATE students SET full_name = ? WHERE id = ?", &full_name)?;
    }
    if let Some(roll_number) = get_patch_str(patch, "rollNumber")? {
        let roll_number = roll_number
            .ok_or_else(|| HandlerErr::bad_params("rollNumber must not be empty"))?
            .to_uppercase();
        update(
            "UPDATE students SET roll_number = ? WHERE id = ?",
            &roll_number,
        )?;
    }
    if let Some(semester) = get_optional_i64(patch, "semester")? {
        let semester = check_semester(semester)?;
        update("UPDATE students SET semester = ? WHERE id = ?", &semester)?;
    }
    if let Some(department_id) = get_patch_str(patch, "departmentId")? {
        if let Some(d) = &department_id {
            ensure_exists(&tx, "departments", d, "department")?;
        }
        update(
            "UPDATE students SET department_id = ? WHERE id = ?",
            &department_id,
        )?;
    }
    if let Some(degree_id) = get_patch_str(patch, "degreeId")? {
        if let Some(d) = &degree_id {
            ensure_exists(&tx, "degrees", d, "degree")?;
        }
        update("UPDATE students SET degree_id = ? WHERE id = ?", &degree_id)?;
    }
    if let Some(section) = get_patch_str(patch, "section")? {
        update("UPDATE students SET section = ? WHERE id = ?", &section)?;
    }
    if let Some(phone) = get_patch_str(patch, "phone")? {
        update(
            "UPDATE students SET phone = ? WHERE id = ?",
            &phone.unwrap_or_default(),
        )?;
    }
    if let Some(date_of_birth) = get_patch_str(patch, "dateOfBirth")? {
        let date_of_birth = parse_birth_date(date_of_birth)?;
        update(
            "UPDATE students SET date_of_birth = ? WHERE id = ?",
            &date_of_birth,
        )?;
    }
    if let Some(address) = get_patch_str(patch, "address")? {
        update(
            "UPDATE students SET address = ? WHERE id = ?",
            &address.unwrap_or_default(),
        )?;
    }
    update("UPDATE students SET updated_at = ? WHERE id = ?", &now_stamp())?;

    let counts = auto_enroll(&tx, &student_id)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "enrollment": counts }))
}

fn students_delete(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    require_staff(state)?;
    let conn = conn(state)?;
    let student_id = get_required_str(params, "studentId")?;
    ensure_exists(conn, "students", &student_id, "student")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    for (sql, table) in [
        ("DELETE FROM attendance WHERE student_id = ?", "attendance"),
        (
            "DELETE FROM subject_enrollments WHERE student_id = ?",
            "subject_enrollments",
        ),
        (
            "DELETE FROM semester_performances WHERE student_id = ?",
            "semester_performances",
        ),
        (
            "DELETE FROM fee_payments WHERE fee_id IN (SELECT id FROM fees WHERE student_id = ?)",
            "fee_payments",
        ),
        ("DELETE FROM fees WHERE student_id = ?", "fees"),
        ("DELETE FROM students WHERE id = ?", "students"),
    ] {
        tx.execute(sql, [&student_id])
            .map_err(|e| write_err(e, "db_delete_failed", table))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, &req.params),
        "students.create" => students_create(state, &req.params),
        "students.update" => students_update(state, &req.params),
        "students.delete" => students_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn birth_dates_are_normalized_or_rejected() {
        assert_eq!(
            parse_birth_date(Some("2004-02-09".into())).expect("valid"),
            Some("2004-02-09".to_string())
        );
        assert!(parse_birth_date(Some("09/02/2004".into())).is_err());
        assert!(parse_birth_date(Some("2004-13-01".into())).is_err());
        assert_eq!(parse_birth_date(None).expect("none"), None);
    }
}
