use crate::error::{CoreError, CoreResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentCounts {
    pub created: usize,
    pub updated: usize,
}

impl EnrollmentCounts {
    pub fn add(&mut self, other: EnrollmentCounts) {
        self.created += other.created;
        self.updated += other.updated;
    }
}

/// A subject in the student's (department, semester) with its resolved teacher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSubject {
    pub subject_id: String,
    pub teacher_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingEnrollment {
    pub enrollment_id: String,
    pub teacher_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentAction {
    Create {
        subject_id: String,
        teacher_id: Option<String>,
    },
    Reassign {
        enrollment_id: String,
        teacher_id: String,
    },
}

/// Decides what to write for one student. Existing enrollments are only
/// touched when a teacher resolves and differs from the stored one.
pub fn plan_enrollment(
    subjects: &[ResolvedSubject],
    existing: &HashMap<String, ExistingEnrollment>,
) -> Vec<EnrollmentAction> {
    let mut actions = Vec::new();
    for subject in subjects {
        match existing.get(&subject.subject_id) {
            None => actions.push(EnrollmentAction::Create {
                subject_id: subject.subject_id.clone(),
                teacher_id: subject.teacher_id.clone(),
            }),
            Some(current) => {
                let Some(resolved) = subject.teacher_id.as_ref() else {
                    continue;
                };
                if current.teacher_id.as_ref() != Some(resolved) {
                    actions.push(EnrollmentAction::Reassign {
                        enrollment_id: current.enrollment_id.clone(),
                        teacher_id: resolved.clone(),
                    });
                }
            }
        }
    }
    actions
}

pub fn count_actions(actions: &[EnrollmentAction]) -> EnrollmentCounts {
    let mut counts = EnrollmentCounts::default();
    for a in actions {
        match a {
            EnrollmentAction::Create { .. } => counts.created += 1,
            EnrollmentAction::Reassign { .. } => counts.updated += 1,
        }
    }
    counts
}

/// First teacher (creation order) whose taught set contains the subject.
pub fn resolve_teacher(conn: &Connection, subject_id: &str) -> CoreResult<Option<String>> {
    let teacher_id = conn
        .query_row(
            "SELECT t.id
             FROM teachers t
             JOIN teacher_subjects ts ON ts.teacher_id = t.id
             WHERE ts.subject_id = ?
             ORDER BY t.rowid
             LIMIT 1",
            [subject_id],
            |r| r.get::<_, String>(0),
        )
        .optional()?;
    Ok(teacher_id)
}

fn load_resolved_subjects(
    conn: &Connection,
    department_id: &str,
    semester: i64,
) -> CoreResult<Vec<ResolvedSubject>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM subjects WHERE department_id = ? AND semester = ? ORDER BY code",
    )?;
    let subject_ids = stmt
        .query_map((department_id, semester), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(subject_ids.len());
    for subject_id in subject_ids {
        let teacher_id = resolve_teacher(conn, &subject_id)?;
        out.push(ResolvedSubject {
            subject_id,
            teacher_id,
        });
    }
    Ok(out)
}

fn load_existing(
    conn: &Connection,
    student_id: &str,
) -> CoreResult<HashMap<String, ExistingEnrollment>> {
    let mut stmt = conn.prepare(
        "SELECT id, subject_id, teacher_id FROM subject_enrollments WHERE student_id = ?",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(1)?,
                ExistingEnrollment {
                    enrollment_id: r.get(0)?,
                    teacher_id: r.get(2)?,
                },
            ))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

fn apply_actions(
    conn: &Connection,
    student_id: &str,
    actions: &[EnrollmentAction],
) -> CoreResult<()> {
    for action in actions {
        match action {
            EnrollmentAction::Create {
                subject_id,
                teacher_id,
            } => {
                conn.execute(
                    "INSERT INTO subject_enrollments(id, student_id, subject_id, teacher_id)
                     VALUES(?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        student_id,
                        subject_id,
                        teacher_id.as_deref(),
                    ),
                )?;
            }
            EnrollmentAction::Reassign {
                enrollment_id,
                teacher_id,
            } => {
                conn.execute(
                    "UPDATE subject_enrollments SET teacher_id = ? WHERE id = ?",
                    (teacher_id, enrollment_id),
                )?;
            }
        }
    }
    Ok(())
}

/// Brings one student's enrollments in line with their department and
/// semester. Runs inside the caller's transaction when there is one.
pub fn resolve_student(conn: &Connection, student_id: &str) -> CoreResult<EnrollmentCounts> {
    let student: Option<(Option<String>, Option<i64>)> = conn
        .query_row(
            "SELECT department_id, semester FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((department_id, semester)) = student else {
        return Err(CoreError::not_found("student not found"));
    };
    let (Some(department_id), Some(semester)) = (department_id, semester) else {
        return Ok(EnrollmentCounts::default());
    };

    let subjects = load_resolved_subjects(conn, &department_id, semester)?;
    let existing = load_existing(conn, student_id)?;
    let actions = plan_enrollment(&subjects, &existing);
    apply_actions(conn, student_id, &actions)?;
    let counts = count_actions(&actions);
    tracing::debug!(
        student_id,
        created = counts.created,
        updated = counts.updated,
        "enrollment resolved"
    );
    Ok(counts)
}

#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    pub semester: Option<i64>,
    pub department_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentEnrollmentResult {
    pub student_id: String,
    pub roll_number: String,
    pub created: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub matched: usize,
    pub processed: usize,
    pub skipped: Vec<String>,
    pub students: Vec<StudentEnrollmentResult>,
    pub totals: EnrollmentCounts,
}

/// Operator maintenance pass over a filtered student population.
pub fn resolve_batch(conn: &Connection, filter: &BatchFilter) -> CoreResult<BatchReport> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.roll_number, s.department_id, s.semester
         FROM students s
         LEFT JOIN departments d ON d.id = s.department_id
         WHERE (?1 IS NULL OR s.semester = ?1)
           AND (?2 IS NULL OR d.code = ?2)
         ORDER BY s.roll_number",
    )?;
    let students = stmt
        .query_map((filter.semester, filter.department_code.as_deref()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<i64>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut report = BatchReport {
        matched: students.len(),
        ..BatchReport::default()
    };
    for (student_id, roll_number, department_id, semester) in students {
        if department_id.is_none() || semester.is_none() {
            tracing::warn!(roll_number = %roll_number, "skipping student without department or semester");
            report.skipped.push(roll_number);
            continue;
        }
        let counts = resolve_student(conn, &student_id)?;
        report.totals.add(counts);
        report.processed += 1;
        report.students.push(StudentEnrollmentResult {
            student_id,
            roll_number,
            created: counts.created,
            updated: counts.updated,
        });
    }
    tracing::info!(
        matched = report.matched,
        processed = report.processed,
        created = report.totals.created,
        updated = report.totals.updated,
        "batch enrollment finished"
    );
    Ok(report)
}

/// Roster discovery for a teacher opening one of their subjects with no
/// enrollments of their own. Unassigned enrollments of the subject are claimed
/// and every other student of its department and semester gets one defaulting
/// to this teacher. Enrollments held by other teachers are kept.
pub fn ensure_subject_roster(
    conn: &Connection,
    subject_id: &str,
    teacher_id: &str,
) -> CoreResult<usize> {
    let teaches = conn
        .query_row(
            "SELECT 1 FROM teacher_subjects WHERE teacher_id = ? AND subject_id = ?",
            (teacher_id, subject_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if !teaches {
        return Ok(0);
    }
    let has_any = conn
        .query_row(
            "SELECT 1 FROM subject_enrollments WHERE subject_id = ? AND teacher_id = ? LIMIT 1",
            (subject_id, teacher_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if has_any {
        return Ok(0);
    }

    let subject: Option<(String, i64)> = conn
        .query_row(
            "SELECT department_id, semester FROM subjects WHERE id = ?",
            [subject_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((department_id, semester)) = subject else {
        return Err(CoreError::not_found("subject not found"));
    };

    // Claims are provisional: the next resolver run hands these enrollments to the
    // subject's earliest-created teacher, which may not be this one.
    let claimed = conn.execute(
        "UPDATE subject_enrollments SET teacher_id = ?
         WHERE subject_id = ? AND teacher_id IS NULL",
        (teacher_id, subject_id),
    )?;

    let mut stmt = conn.prepare(
        "SELECT s.id
         FROM students s
         WHERE s.department_id = ?1 AND s.semester = ?2
           AND NOT EXISTS (
             SELECT 1 FROM subject_enrollments e
             WHERE e.student_id = s.id AND e.subject_id = ?3
           )
         ORDER BY s.roll_number",
    )?;
    let student_ids = stmt
        .query_map((&department_id, semester, subject_id), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for student_id in &student_ids {
        conn.execute(
            "INSERT INTO subject_enrollments(id, student_id, subject_id, teacher_id)
             VALUES(?, ?, ?, ?)",
            (Uuid::new_v4().to_string(), student_id, subject_id, teacher_id),
        )?;
    }
    let created = student_ids.len();
    if created + claimed > 0 {
        tracing::debug!(subject_id, teacher_id, created, claimed, "subject roster discovered");
    }
    Ok(created + claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn subject(id: &str, teacher: Option<&str>) -> ResolvedSubject {
        ResolvedSubject {
            subject_id: id.to_string(),
            teacher_id: teacher.map(|t| t.to_string()),
        }
    }

    fn existing(id: &str, teacher: Option<&str>) -> ExistingEnrollment {
        ExistingEnrollment {
            enrollment_id: id.to_string(),
            teacher_id: teacher.map(|t| t.to_string()),
        }
    }

    #[test]
    fn plan_creates_missing_and_reassigns_changed_teacher() {
        let subjects = vec![
            subject("s1", Some("t1")),
            subject("s2", None),
            subject("s3", Some("t2")),
        ];
        let mut current = HashMap::new();
        current.insert("s3".to_string(), existing("e3", Some("t1")));
        let actions = plan_enrollment(&subjects, &current);
        assert_eq!(
            actions,
            vec![
                EnrollmentAction::Create {
                    subject_id: "s1".into(),
                    teacher_id: Some("t1".into())
                },
                EnrollmentAction::Create {
                    subject_id: "s2".into(),
                    teacher_id: None
                },
                EnrollmentAction::Reassign {
                    enrollment_id: "e3".into(),
                    teacher_id: "t2".into()
                },
            ]
        );
        assert_eq!(
            count_actions(&actions),
            EnrollmentCounts {
                created: 2,
                updated: 1
            }
        );
    }

    #[test]
    fn plan_leaves_stored_teacher_when_none_resolves() {
        let subjects = vec![subject("s1", None), subject("s2", Some("t1"))];
        let mut current = HashMap::new();
        current.insert("s1".to_string(), existing("e1", Some("t9")));
        current.insert("s2".to_string(), existing("e2", Some("t1")));
        assert!(plan_enrollment(&subjects, &current).is_empty());
    }

    fn seed(conn: &Connection) {
        conn.execute(
            "INSERT INTO departments(id, name, code) VALUES('d1', 'Computer Science', 'CSE')",
            [],
        )
        .expect("dept");
        for (id, code) in [("s1", "CS301"), ("s2", "CS302"), ("s3", "CS303")] {
            conn.execute(
                "INSERT INTO subjects(id, name, code, semester, department_id, credits, is_lab)
                 VALUES(?, ?, ?, 3, 'd1', 3, 0)",
                (id, code, code),
            )
            .expect("subject");
        }
        conn.execute(
            "INSERT INTO teachers(id, full_name, employee_id) VALUES('t1', 'T One', 'E1')",
            [],
        )
        .expect("t1");
        conn.execute(
            "INSERT INTO teachers(id, full_name, employee_id) VALUES('t2', 'T Two', 'E2')",
            [],
        )
        .expect("t2");
        conn.execute(
            "INSERT INTO teacher_subjects(teacher_id, subject_id) VALUES('t1', 's1')",
            [],
        )
        .expect("assign");
        conn.execute(
            "INSERT INTO students(id, full_name, roll_number, department_id, semester)
             VALUES('st1', 'Asha Rao', 'R001', 'd1', 3)",
            [],
        )
        .expect("student");
    }

    #[test]
    fn resolver_is_idempotent_and_tracks_teacher_changes() {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        seed(&conn);

        let first = resolve_student(&conn, "st1").expect("first run");
        assert_eq!(first, EnrollmentCounts { created: 3, updated: 0 });
        let second = resolve_student(&conn, "st1").expect("second run");
        assert_eq!(second, EnrollmentCounts::default());

        conn.execute("DELETE FROM teacher_subjects WHERE teacher_id = 't1'", [])
            .expect("unassign");
        conn.execute(
            "INSERT INTO teacher_subjects(teacher_id, subject_id) VALUES('t2', 's1')",
            [],
        )
        .expect("reassign");
        let third = resolve_student(&conn, "st1").expect("third run");
        assert_eq!(third, EnrollmentCounts { created: 0, updated: 1 });

        let teacher: Option<String> = conn
            .query_row(
                "SELECT teacher_id FROM subject_enrollments WHERE student_id = 'st1' AND subject_id = 's1'",
                [],
                |r| r.get(0),
            )
            .expect("row");
        assert_eq!(teacher.as_deref(), Some("t2"));
    }

    #[test]
    fn resolver_picks_first_created_teacher() {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        seed(&conn);
        conn.execute(
            "INSERT INTO teacher_subjects(teacher_id, subject_id) VALUES('t2', 's1')",
            [],
        )
        .expect("second teacher");
        assert_eq!(
            resolve_teacher(&conn, "s1").expect("resolve").as_deref(),
            Some("t1")
        );
    }

    #[test]
    fn resolver_is_noop_without_department() {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        seed(&conn);
        conn.execute("UPDATE students SET department_id = NULL", [])
            .expect("clear dept");
        assert_eq!(
            resolve_student(&conn, "st1").expect("run"),
            EnrollmentCounts::default()
        );
        let report = resolve_batch(&conn, &BatchFilter::default()).expect("batch");
        assert_eq!(report.matched, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped, vec!["R001".to_string()]);
    }

    #[test]
    fn batch_filters_by_department_code() {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        seed(&conn);
        let none = resolve_batch(
            &conn,
            &BatchFilter {
                semester: None,
                department_code: Some("ECE".into()),
            },
        )
        .expect("batch");
        assert_eq!(none.matched, 0);

        let cse = resolve_batch(
            &conn,
            &BatchFilter {
                semester: Some(3),
                department_code: Some("CSE".into()),
            },
        )
        .expect("batch");
        assert_eq!(cse.processed, 1);
        assert_eq!(cse.totals, EnrollmentCounts { created: 3, updated: 0 });
    }

    #[test]
    fn roster_discovery_only_runs_when_teacher_has_no_enrollments() {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        seed(&conn);
        // t2 does not teach s2 yet.
        assert_eq!(ensure_subject_roster(&conn, "s2", "t2").expect("roster"), 0);
        conn.execute(
            "INSERT INTO teacher_subjects(teacher_id, subject_id) VALUES('t2', 's2')",
            [],
        )
        .expect("assign");
        assert_eq!(ensure_subject_roster(&conn, "s2", "t2").expect("roster"), 1);
        assert_eq!(ensure_subject_roster(&conn, "s2", "t2").expect("roster"), 0);
        let counts = resolve_student(&conn, "st1").expect("resolve");
        assert_eq!(counts, EnrollmentCounts { created: 2, updated: 0 });
    }

    #[test]
    fn roster_discovery_claims_unassigned_enrollments() {
        let conn = Connection::open_in_memory().expect("open");
        db::init_schema(&conn).expect("schema");
        seed(&conn);
        // Enrolled before anyone taught s3.
        resolve_student(&conn, "st1").expect("resolve");
        conn.execute(
            "INSERT INTO teacher_subjects(teacher_id, subject_id) VALUES('t2', 's3')",
            [],
        )
        .expect("assign");
        assert_eq!(ensure_subject_roster(&conn, "s3", "t2").expect("roster"), 1);
        let teacher: Option<String> = conn
            .query_row(
                "SELECT teacher_id FROM subject_enrollments WHERE student_id = 'st1' AND subject_id = 's3'",
                [],
                |r| r.get(0),
            )
            .expect("enrollment");
        assert_eq!(teacher.as_deref(), Some("t2"));
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM subject_enrollments", [], |r| r.get(0))
            .expect("count");
        assert_eq!(rows, 3);
    }
}
