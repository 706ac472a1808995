use crate::calc;
use crate::enrollment;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{account, conn, ensure_exists, get_optional_str, get_required_str};
use crate::ipc::types::{Account, AppState, Request};
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use uuid::Uuid;

fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

fn optional_date(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    get_optional_str(params, key)?
        .map(|s| parse_date(&s, key).map(|d| d.format("%Y-%m-%d").to_string()))
        .transpose()
}

fn attendance_row(present: i64, total: i64, threshold: f64) -> Value {
    let percentage = calc::attendance_percentage(present, total);
    json!({
        "present": present,
        "absent": total - present,
        "total": total,
        "percentage": percentage,
        "shortage": total > 0 && percentage < threshold,
    })
}

fn attendance_mark(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = match account(state)? {
        Account::Admin => None,
        Account::Teacher { teacher_id } => Some(teacher_id.clone()),
        Account::Student { .. } => return Err(HandlerErr::forbidden("staff only")),
    };
    let conn = conn(state)?;
    let subject_id = get_required_str(params, "subjectId")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;
    let date = parse_date(&get_required_str(params, "date")?, "date")?
        .format("%Y-%m-%d")
        .to_string();
    let entries = params
        .get("entries")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("entries must be an array"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if let Some(t) = &teacher_id {
        enrollment::ensure_subject_roster(&tx, &subject_id, t)?;
    }

    let mut marked = 0usize;
    for (i, entry) in entries.iter().enumerate() {
        let student_id = get_required_str(entry, "studentId")?;
        let present = entry
            .get("present")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| HandlerErr::bad_params(format!("entries[{}].present must be boolean", i)))?;
        let enrolled_teacher: Option<Option<String>> = tx
            .query_row(
                "SELECT teacher_id FROM subject_enrollments WHERE student_id = ? AND subject_id = ?",
                (&student_id, &subject_id),
                |r| r.get(0),
            )
            .optional()?;
        let Some(enrolled_teacher) = enrolled_teacher else {
            return Err(HandlerErr::bad_params(format!(
                "entries[{}]: student is not enrolled in this subject",
                i
            )));
        };
        if teacher_id.is_some() && enrolled_teacher != teacher_id {
            return Err(HandlerErr::forbidden(format!(
                "entries[{}]: enrollment is assigned to another teacher",
                i
            )));
        }
        tx.execute(
            "INSERT INTO attendance(id, student_id, subject_id, date, is_present, marked_by)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, subject_id, date) DO UPDATE SET
               is_present = excluded.is_present,
               marked_by = excluded.marked_by",
            (
                Uuid::new_v4().to_string(),
                &student_id,
                &subject_id,
                &date,
                present as i64,
                teacher_id.as_deref(),
            ),
        )
        .map_err(|e| HandlerErr::db_write("db_insert_failed", e, "attendance"))?;
        marked += 1;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "date": date, "marked": marked }))
}

fn attendance_subject_report(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = match account(state)? {
        Account::Admin => None,
        Account::Teacher { teacher_id } => Some(teacher_id.clone()),
        Account::Student { .. } => return Err(HandlerErr::forbidden("staff only")),
    };
    let conn = conn(state)?;
    let subject_id = get_required_str(params, "subjectId")?;
    ensure_exists(conn, "subjects", &subject_id, "subject")?;
    let from = optional_date(params, "from")?;
    let to = optional_date(params, "to")?;
    let threshold = setup::shortage_threshold(conn)?;

    if let Some(t) = &teacher_id {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        enrollment::ensure_subject_roster(&tx, &subject_id, t)?;
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    }

    let mut stmt = conn.prepare(
        "SELECT st.id, st.roll_number, st.full_name,
                COUNT(a.id),
                COALESCE(SUM(a.is_present), 0)
         FROM subject_enrollments e
         JOIN students st ON st.id = e.student_id
         LEFT JOIN attendance a
           ON a.student_id = e.student_id
          AND a.subject_id = e.subject_id
          AND (?3 IS NULL OR a.date >= ?3)
          AND (?4 IS NULL OR a.date <= ?4)
         WHERE e.subject_id = ?1 AND (?2 IS NULL OR e.teacher_id = ?2)
         GROUP BY st.id, st.roll_number, st.full_name
         ORDER BY st.roll_number",
    )?;
    let students = stmt
        .query_map(
            (&subject_id, teacher_id.as_deref(), from.as_deref(), to.as_deref()),
            |r| {
                let total: i64 = r.get(3)?;
                let present: i64 = r.get(4)?;
                let mut row = attendance_row(present, total, threshold);
                row["studentId"] = json!(r.get::<_, String>(0)?);
                row["rollNumber"] = json!(r.get::<_, String>(1)?);
                row["fullName"] = json!(r.get::<_, String>(2)?);
                Ok(row)
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let class_days: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT date) FROM attendance
         WHERE subject_id = ?1 AND (?2 IS NULL OR date >= ?2) AND (?3 IS NULL OR date <= ?3)",
        (&subject_id, from.as_deref(), to.as_deref()),
        |r| r.get(0),
    )?;
    Ok(json!({
        "subjectId": subject_id,
        "classDays": class_days,
        "shortageThresholdPercent": threshold,
        "students": students,
    }))
}

fn attendance_student_summary(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = match account(state)? {
        Account::Student { student_id } => student_id.clone(),
        _ => get_required_str(params, "studentId")?,
    };
    let conn = conn(state)?;
    ensure_exists(conn, "students", &student_id, "student")?;
    let threshold = setup::shortage_threshold(conn)?;

    let mut stmt = conn.prepare(
        "SELECT s.id, s.code, s.name,
                COUNT(a.id),
                COALESCE(SUM(a.is_present), 0)
         FROM subject_enrollments e
         JOIN subjects s ON s.id = e.subject_id
         LEFT JOIN attendance a ON a.student_id = e.student_id AND a.subject_id = e.subject_id
         WHERE e.student_id = ?
         GROUP BY s.id, s.code, s.name, s.semester
         ORDER BY s.semester, s.code",
    )?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let (mut present_all, mut total_all) = (0i64, 0i64);
    let mut subjects = Vec::with_capacity(rows.len());
    for (subject_id, code, name, total, present) in rows {
        present_all += present;
        total_all += total;
        let mut row = attendance_row(present, total, threshold);
        row["subjectId"] = json!(subject_id);
        row["subjectCode"] = json!(code);
        row["subjectName"] = json!(name);
        subjects.push(row);
    }
    Ok(json!({
        "studentId": student_id,
        "shortageThresholdPercent": threshold,
        "subjects": subjects,
        "overall": attendance_row(present_all, total_all, threshold),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "attendance.mark" => attendance_mark(state, &req.params),
        "attendance.subjectReport" => attendance_subject_report(state, &req.params),
        "attendance.studentSummary" => attendance_student_summary(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
