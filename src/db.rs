use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "erp.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS degrees(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            code TEXT NOT NULL DEFAULT '',
            university_name TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            semester INTEGER NOT NULL CHECK(semester BETWEEN 1 AND 8),
            department_id TEXT NOT NULL,
            credits INTEGER NOT NULL DEFAULT 3 CHECK(credits > 0),
            is_lab INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_dept_sem ON subjects(department_id, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            employee_id TEXT NOT NULL UNIQUE,
            department_id TEXT,
            phone TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_subjects(
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(teacher_id, subject_id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_subjects_subject ON teacher_subjects(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            roll_number TEXT NOT NULL UNIQUE,
            department_id TEXT,
            degree_id TEXT,
            section TEXT,
            semester INTEGER NOT NULL CHECK(semester BETWEEN 1 AND 8),
            phone TEXT NOT NULL DEFAULT '',
            date_of_birth TEXT,
            address TEXT NOT NULL DEFAULT '',
            updated_at TEXT,
            FOREIGN KEY(department_id) REFERENCES departments(id),
            FOREIGN KEY(degree_id) REFERENCES degrees(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_dept_sem ON students(department_id, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            teacher_id TEXT,
            mid1_marks REAL,
            mid2_marks REAL,
            put_marks REAL,
            practical_marks REAL,
            external_marks REAL,
            total_marks REAL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(student_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON subject_enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_subject_teacher ON subject_enrollments(subject_id, teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            date TEXT NOT NULL,
            is_present INTEGER NOT NULL DEFAULT 1,
            marked_by TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(marked_by) REFERENCES teachers(id),
            UNIQUE(student_id, subject_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_subject ON attendance(subject_id)",
        [],
    )?;

    // Uniqueness of (degree_id, section, semester) is enforced by the timetable
    // module with NULL-aware lookups; SQLite UNIQUE treats NULLs as distinct.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetables(
            id TEXT PRIMARY KEY,
            degree_id TEXT,
            section TEXT NOT NULL,
            semester INTEGER CHECK(semester IS NULL OR semester BETWEEN 1 AND 8),
            lecture1 TEXT,
            lecture2 TEXT,
            lecture3 TEXT,
            lecture4 TEXT,
            lecture5 TEXT,
            lecture6 TEXT,
            lecture7 TEXT,
            lunch TEXT,
            lecture1_subject_id TEXT,
            lecture2_subject_id TEXT,
            lecture3_subject_id TEXT,
            lecture4_subject_id TEXT,
            lecture5_subject_id TEXT,
            lecture6_subject_id TEXT,
            lecture7_subject_id TEXT,
            updated_at TEXT,
            FOREIGN KEY(degree_id) REFERENCES degrees(id)
        )",
        [],
    )?;
    ensure_timetables_active_days(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetables_key ON timetables(degree_id, section, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_slots(
            id TEXT PRIMARY KEY,
            timetable_id TEXT NOT NULL,
            day TEXT NOT NULL CHECK(day IN ('mon','tue','wed','thu','fri','sat')),
            lecture_number INTEGER NOT NULL CHECK(lecture_number BETWEEN 1 AND 7),
            subject_id TEXT,
            FOREIGN KEY(timetable_id) REFERENCES timetables(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(timetable_id, day, lecture_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_slots_timetable ON timetable_slots(timetable_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semester_performances(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            semester INTEGER NOT NULL CHECK(semester BETWEEN 1 AND 8),
            sgpa REAL NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, semester)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fees(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            title TEXT NOT NULL CHECK(title IN (
                'tuition','library','lab','infrastructure',
                'examination','sports','hostel','other'
            )),
            amount_paise INTEGER NOT NULL CHECK(amount_paise >= 0),
            fine_paise INTEGER NOT NULL DEFAULT 0 CHECK(fine_paise >= 0),
            rewards_paise INTEGER NOT NULL DEFAULT 0 CHECK(rewards_paise >= 0),
            allocated_on TEXT NOT NULL,
            is_verified INTEGER NOT NULL DEFAULT 0,
            verified_on TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, title)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_payments(
            id TEXT PRIMARY KEY,
            fee_id TEXT NOT NULL,
            amount_paise INTEGER NOT NULL CHECK(amount_paise > 0),
            paid_on TEXT NOT NULL,
            transaction_id TEXT NOT NULL UNIQUE,
            payment_method TEXT NOT NULL DEFAULT 'online'
                CHECK(payment_method IN ('cheque','draft','online','cash')),
            remarks TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(fee_id) REFERENCES fees(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_payments_fee ON fee_payments(fee_id)",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn ensure_timetables_active_days(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "timetables", "active_days")? {
        return Ok(());
    }
    // Timetables created before per-day schedules ran every weekday.
    conn.execute(
        "ALTER TABLE timetables ADD COLUMN active_days TEXT NOT NULL DEFAULT 'mon,tue,wed,thu,fri,sat'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
