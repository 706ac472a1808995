use crate::calc::{self, ComponentMarks, MarkComponent, SubjectKind};
use crate::enrollment;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{account, conn, ensure_exists, get_required_str};
use crate::ipc::types::{Account, AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};

struct EnrollmentRef {
    student_id: String,
    subject_id: String,
    teacher_id: Option<String>,
    kind: SubjectKind,
}

fn load_enrollment(conn: &Connection, enrollment_id: &str) -> Result<EnrollmentRef, HandlerErr> {
    conn.query_row(
        "SELECT e.student_id, e.subject_id, e.teacher_id, s.is_lab
         FROM subject_enrollments e
         JOIN subjects s ON s.id = e.subject_id
         WHERE e.id = ?",
        [enrollment_id],
        |r| {
            Ok(EnrollmentRef {
                student_id: r.get(0)?,
                subject_id: r.get(1)?,
                teacher_id: r.get(2)?,
                kind: SubjectKind::from_is_lab(r.get::<_, i64>(3)? != 0),
            })
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("enrollment not found"))
}

/// Internal marks belong to the enrollment's teacher; admins may edit any.
fn check_internal_access(account: &Account, enrollment: &EnrollmentRef) -> Result<(), HandlerErr> {
    match account {
        Account::Admin => Ok(()),
        Account::Teacher { teacher_id }
            if enrollment.teacher_id.as_deref() == Some(teacher_id.as_str()) =>
        {
            Ok(())
        }
        Account::Teacher { .. } => Err(HandlerErr::forbidden(
            "enrollment is assigned to another teacher",
        )),
        Account::Student { .. } => Err(HandlerErr::forbidden("students cannot enter internal marks")),
    }
}

/// Parses `{ "mid1": 20, "put": null, ... }` into validated component updates.
fn parse_internal_marks(
    kind: SubjectKind,
    marks: &Map<String, Value>,
) -> Result<Vec<(MarkComponent, Option<f64>)>, HandlerErr> {
    let mut out = Vec::with_capacity(marks.len());
    for (key, value) in marks {
        let component = MarkComponent::parse(key)
            .filter(|c| *c != MarkComponent::External)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown internal component: {}", key)))?;
        let raw = match value {
            Value::Null => None,
            v => Some(v.as_f64().ok_or_else(|| {
                HandlerErr::bad_params(format!("{} must be number or null", key))
            })?),
        };
        out.push((component, component.validate(kind, raw)?));
    }
    Ok(out)
}

/// Writes components and recomputes the stored total in the caller's transaction.
fn write_components(
    conn: &Connection,
    enrollment_id: &str,
    updates: &[(MarkComponent, Option<f64>)],
) -> Result<Option<f64>, HandlerErr> {
    for (component, value) in updates {
        let sql = format!(
            "UPDATE subject_enrollments SET {} = ? WHERE id = ?",
            component.column()
        );
        conn.execute(&sql, (value, enrollment_id))
            .map_err(|e| HandlerErr::db_write("db_update_failed", e, "subject_enrollments"))?;
    }
    Ok(calc::refresh_enrollment_total(conn, enrollment_id)?)
}

fn marks_set_internal(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let account = account(state)?.clone();
    let conn = conn(state)?;
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let enrollment = load_enrollment(conn, &enrollment_id)?;
    check_internal_access(&account, &enrollment)?;
    let marks = params
        .get("marks")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("marks must be an object"))?;
    let updates = parse_internal_marks(enrollment.kind, marks)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let total = write_components(&tx, &enrollment_id, &updates)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "enrollmentId": enrollment_id, "totalMarks": total }))
}

fn marks_bulk_entry(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let account = account(state)?.clone();
    let conn = conn(state)?;
    let subject_id = get_required_str(params, "subjectId")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;
    let rows = params
        .get("rows")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("rows must be an array"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut updated = 0usize;
    let mut rejected = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let enrollment_id = get_required_str(row, "enrollmentId")?;
        let enrollment = load_enrollment(&tx, &enrollment_id)?;
        if enrollment.subject_id != subject_id {
            return Err(HandlerErr::bad_params(format!(
                "rows[{}] belongs to another subject",
                i
            )));
        }
        check_internal_access(&account, &enrollment)?;
        let marks = row
            .get("marks")
            .and_then(|v| v.as_object())
            .ok_or_else(|| HandlerErr::bad_params(format!("rows[{}].marks must be an object", i)))?;
        // A bad row is reported back; the rest of the sheet still saves.
        let updates = match parse_internal_marks(enrollment.kind, marks) {
            Ok(u) => u,
            Err(e) => {
                rejected.push(json!({
                    "row": i,
                    "enrollmentId": enrollment_id,
                    "studentId": enrollment.student_id,
                    "message": e.message,
                }));
                continue;
            }
        };
        write_components(&tx, &enrollment_id, &updates)?;
        updated += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    if !rejected.is_empty() {
        tracing::warn!(subject_id = %subject_id, rejected = rejected.len(), "marks rows rejected");
    }
    Ok(json!({ "updated": updated, "rejected": rejected }))
}

fn marks_subject_sheet(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = match account(state)? {
        Account::Admin => None,
        Account::Teacher { teacher_id } => Some(teacher_id.clone()),
        Account::Student { .. } => return Err(HandlerErr::forbidden("staff only")),
    };
    let conn = conn(state)?;
    let subject_id = get_required_str(params, "subjectId")?;
    let (code, name, is_lab): (String, String, i64) = conn
        .query_row(
            "SELECT code, name, is_lab FROM subjects WHERE id = ?",
            [&subject_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("subject not found"))?;
    let kind = SubjectKind::from_is_lab(is_lab != 0);

    let mut discovered = 0;
    if let Some(t) = &teacher_id {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        discovered = enrollment::ensure_subject_roster(&tx, &subject_id, t)?;
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    }

    let mut stmt = conn.prepare(
        "SELECT e.id, st.id, st.roll_number, st.full_name,
                e.mid1_marks, e.mid2_marks, e.put_marks, e.practical_marks,
                e.external_marks, e.total_marks
         FROM subject_enrollments e
         JOIN students st ON st.id = e.student_id
         WHERE e.subject_id = ?1 AND (?2 IS NULL OR e.teacher_id = ?2)
         ORDER BY st.roll_number",
    )?;
    let rows = stmt
        .query_map((&subject_id, teacher_id.as_deref()), |r| {
            let marks = ComponentMarks {
                mid1: r.get(4)?,
                mid2: r.get(5)?,
                put: r.get(6)?,
                practical: r.get(7)?,
                external: r.get(8)?,
            };
            let total: Option<f64> = r.get(9)?;
            Ok(json!({
                "enrollmentId": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "rollNumber": r.get::<_, String>(2)?,
                "fullName": r.get::<_, String>(3)?,
                "marks": marks,
                "internal": calc::internal_subtotal(kind, &marks),
                "totalMarks": total,
                "percentage": calc::percentage(kind, total),
                "grade": calc::letter_grade(total, Some(kind.total_max())),
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "subject": { "id": subject_id, "code": code, "name": name, "kind": kind },
        "internalMax": kind.internal_max(),
        "maxMarks": kind.total_max(),
        "discovered": discovered,
        "rows": rows,
    }))
}

fn marks_set_external(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let account = account(state)?.clone();
    let conn = conn(state)?;
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let enrollment = load_enrollment(conn, &enrollment_id)?;
    match &account {
        Account::Admin => {}
        Account::Student { student_id } if *student_id == enrollment.student_id => {}
        _ => {
            return Err(HandlerErr::forbidden(
                "external marks are entered by the enrolled student",
            ))
        }
    }
    let raw = match params.get("value") {
        None => return Err(HandlerErr::bad_params("missing value")),
        Some(Value::Null) => None,
        Some(v) => Some(
            v.as_f64()
                .ok_or_else(|| HandlerErr::bad_params("value must be number or null"))?,
        ),
    };
    let value = MarkComponent::External.validate(enrollment.kind, raw)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let total = write_components(&tx, &enrollment_id, &[(MarkComponent::External, value)])?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "enrollmentId": enrollment_id, "totalMarks": total }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "marks.setInternal" => marks_set_internal(state, &req.params),
        "marks.bulkEntry" => marks_bulk_entry(state, &req.params),
        "marks.subjectSheet" => marks_subject_sheet(state, &req.params),
        "marks.setExternal" => marks_set_external(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
