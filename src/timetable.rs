use crate::error::{CoreError, CoreResult};
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

pub const LECTURES_PER_DAY: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl Weekday {
    pub const ALL: [Weekday; 6] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mon" => Some(Self::Mon),
            "tue" => Some(Self::Tue),
            "wed" => Some(Self::Wed),
            "thu" => Some(Self::Thu),
            "fri" => Some(Self::Fri),
            "sat" => Some(Self::Sat),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Mon => "mon",
            Self::Tue => "tue",
            Self::Wed => "wed",
            Self::Thu => "thu",
            Self::Fri => "fri",
            Self::Sat => "sat",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Mon => "Monday",
            Self::Tue => "Tuesday",
            Self::Wed => "Wednesday",
            Self::Thu => "Thursday",
            Self::Fri => "Friday",
            Self::Sat => "Saturday",
        }
    }
}

/// Parses a comma-separated day list, keeping first-seen order.
pub fn parse_active_days(raw: &str) -> CoreResult<Vec<Weekday>> {
    let mut days = Vec::new();
    for part in raw.split(',') {
        if part.trim().is_empty() {
            continue;
        }
        let Some(day) = Weekday::parse(part) else {
            return Err(CoreError::invalid(format!("unknown day: {}", part.trim())));
        };
        if !days.contains(&day) {
            days.push(day);
        }
    }
    Ok(days)
}

pub fn format_active_days(days: &[Weekday]) -> String {
    days.iter().map(|d| d.code()).collect::<Vec<_>>().join(",")
}

pub fn check_lecture_number(n: i64) -> CoreResult<u8> {
    if (1..=i64::from(LECTURES_PER_DAY)).contains(&n) {
        Ok(n as u8)
    } else {
        Err(CoreError::invalid(format!(
            "lecture number must be between 1 and {}",
            LECTURES_PER_DAY
        )))
    }
}

pub fn parse_time(raw: &str) -> CoreResult<NaiveTime> {
    let t = raw.trim();
    NaiveTime::parse_from_str(t, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
        .map_err(|_| CoreError::invalid(format!("time must be HH:MM, got {}", t)))
}

fn format_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimetableKey {
    pub degree_id: Option<String>,
    pub section: String,
    pub semester: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct TimetableInput {
    pub lecture_times: [Option<NaiveTime>; LECTURES_PER_DAY as usize],
    pub lecture_subjects: [Option<String>; LECTURES_PER_DAY as usize],
    pub lunch: Option<NaiveTime>,
    pub active_days: Vec<Weekday>,
    /// Sparse per-day assignments; anything absent is written as an empty slot.
    pub slots: HashMap<(Weekday, u8), Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub timetable_id: String,
    pub created: bool,
    pub removed_slots: usize,
    pub written_slots: usize,
}

pub fn find_timetable_id(conn: &Connection, key: &TimetableKey) -> CoreResult<Option<String>> {
    let id = conn
        .query_row(
            "SELECT id FROM timetables
             WHERE degree_id IS ? AND section = ? AND semester IS ?
             ORDER BY rowid
             LIMIT 1",
            (key.degree_id.as_deref(), &key.section, key.semester),
            |r| r.get::<_, String>(0),
        )
        .optional()?;
    Ok(id)
}

pub fn upsert_slot(
    conn: &Connection,
    timetable_id: &str,
    day: Weekday,
    lecture_number: u8,
    subject_id: Option<&str>,
) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO timetable_slots(id, timetable_id, day, lecture_number, subject_id)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(timetable_id, day, lecture_number) DO UPDATE SET
           subject_id = excluded.subject_id",
        (
            Uuid::new_v4().to_string(),
            timetable_id,
            day.code(),
            i64::from(lecture_number),
            subject_id,
        ),
    )?;
    Ok(())
}

/// Deletes slots of every day outside `active`.
pub fn prune_inactive_slots(
    conn: &Connection,
    timetable_id: &str,
    active: &[Weekday],
) -> CoreResult<usize> {
    let mut removed = 0;
    for day in Weekday::ALL {
        if active.contains(&day) {
            continue;
        }
        removed += conn.execute(
            "DELETE FROM timetable_slots WHERE timetable_id = ? AND day = ?",
            (timetable_id, day.code()),
        )?;
    }
    Ok(removed)
}

/// Creates or updates the timetable for `key` and rewrites its slot grid.
/// The caller owns the transaction.
pub fn save_timetable(
    conn: &Connection,
    key: &TimetableKey,
    input: &TimetableInput,
) -> CoreResult<SaveOutcome> {
    if key.section.trim().is_empty() {
        return Err(CoreError::invalid("section must not be empty"));
    }
    let times: Vec<Option<String>> = input
        .lecture_times
        .iter()
        .map(|t| t.map(format_time))
        .collect();
    let lunch = input.lunch.map(format_time);
    let active_days = format_active_days(&input.active_days);
    let s = &input.lecture_subjects;

    let existing = find_timetable_id(conn, key)?;
    let created = existing.is_none();
    let timetable_id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());
    if created {
        conn.execute(
            "INSERT INTO timetables(id, degree_id, section, semester, active_days)
             VALUES(?, ?, ?, ?, ?)",
            (
                &timetable_id,
                key.degree_id.as_deref(),
                &key.section,
                key.semester,
                &active_days,
            ),
        )?;
    }
    conn.execute(
        "UPDATE timetables SET
           lecture1 = ?, lecture2 = ?, lecture3 = ?, lecture4 = ?,
           lecture5 = ?, lecture6 = ?, lecture7 = ?, lunch = ?,
           lecture1_subject_id = ?, lecture2_subject_id = ?, lecture3_subject_id = ?,
           lecture4_subject_id = ?, lecture5_subject_id = ?, lecture6_subject_id = ?,
           lecture7_subject_id = ?,
           active_days = ?,
           updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        rusqlite::params![
            times[0], times[1], times[2], times[3], times[4], times[5], times[6], lunch,
            s[0], s[1], s[2], s[3], s[4], s[5], s[6],
            active_days,
            timetable_id,
        ],
    )?;

    let removed_slots = prune_inactive_slots(conn, &timetable_id, &input.active_days)?;
    if removed_slots > 0 {
        tracing::debug!(
            timetable_id = %timetable_id,
            removed_slots,
            "removed slots of deactivated days"
        );
    }

    let mut written_slots = 0;
    for day in &input.active_days {
        for lecture in 1..=LECTURES_PER_DAY {
            let subject = input.slots.get(&(*day, lecture)).cloned().flatten();
            upsert_slot(conn, &timetable_id, *day, lecture, subject.as_deref())?;
            written_slots += 1;
        }
    }

    Ok(SaveOutcome {
        timetable_id,
        created,
        removed_slots,
        written_slots,
    })
}

/// Single-cell edit. Inactive days are refused so no slot outlives its day.
pub fn set_slot(
    conn: &Connection,
    timetable_id: &str,
    day: Weekday,
    lecture_number: u8,
    subject_id: Option<&str>,
) -> CoreResult<()> {
    let raw_days: Option<String> = conn
        .query_row(
            "SELECT active_days FROM timetables WHERE id = ?",
            [timetable_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(raw_days) = raw_days else {
        return Err(CoreError::not_found("timetable not found"));
    };
    let active = parse_active_days(&raw_days)?;
    if !active.contains(&day) {
        return Err(CoreError::invalid(format!(
            "{} is not an active day for this timetable",
            day.code()
        )));
    }
    upsert_slot(conn, timetable_id, day, lecture_number, subject_id)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LectureCell {
    pub lecture_number: u8,
    pub time: String,
    pub subject_id: Option<String>,
    pub subject_code: Option<String>,
    pub subject_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySchedule {
    pub day: &'static str,
    pub label: &'static str,
    pub lectures: Vec<LectureCell>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableView {
    pub id: String,
    pub degree_id: Option<String>,
    pub section: String,
    pub semester: Option<i64>,
    pub lecture_times: Vec<Option<String>>,
    pub lecture_subject_ids: Vec<Option<String>>,
    pub lunch: Option<String>,
    pub active_days: Vec<&'static str>,
    pub days: Vec<DaySchedule>,
}

pub fn load_timetable(conn: &Connection, timetable_id: &str) -> CoreResult<Option<TimetableView>> {
    #[allow(clippy::type_complexity)]
    let row: Option<(
        Option<String>,
        String,
        Option<i64>,
        Vec<Option<String>>,
        Vec<Option<String>>,
        Option<String>,
        String,
    )> = conn
        .query_row(
            "SELECT degree_id, section, semester,
                    lecture1, lecture2, lecture3, lecture4, lecture5, lecture6, lecture7,
                    lecture1_subject_id, lecture2_subject_id, lecture3_subject_id,
                    lecture4_subject_id, lecture5_subject_id, lecture6_subject_id,
                    lecture7_subject_id,
                    lunch, active_days
             FROM timetables WHERE id = ?",
            [timetable_id],
            |r| {
                let mut times = Vec::with_capacity(7);
                for i in 3..10 {
                    times.push(r.get::<_, Option<String>>(i)?);
                }
                let mut subjects = Vec::with_capacity(7);
                for i in 10..17 {
                    subjects.push(r.get::<_, Option<String>>(i)?);
                }
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    times,
                    subjects,
                    r.get(17)?,
                    r.get(18)?,
                ))
            },
        )
        .optional()?;
    let Some((degree_id, section, semester, lecture_times, lecture_subject_ids, lunch, raw_days)) =
        row
    else {
        return Ok(None);
    };
    let active = parse_active_days(&raw_days)?;

    let mut stmt = conn.prepare(
        "SELECT ts.day, ts.lecture_number, ts.subject_id, s.code, s.name
         FROM timetable_slots ts
         LEFT JOIN subjects s ON s.id = ts.subject_id
         WHERE ts.timetable_id = ?",
    )?;
    let mut by_cell: HashMap<(String, i64), (Option<String>, Option<String>, Option<String>)> =
        HashMap::new();
    let rows = stmt.query_map([timetable_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, i64>(1)?,
            r.get::<_, Option<String>>(2)?,
            r.get::<_, Option<String>>(3)?,
            r.get::<_, Option<String>>(4)?,
        ))
    })?;
    for row in rows {
        let (day, lecture, subject_id, code, name) = row?;
        by_cell.insert((day, lecture), (subject_id, code, name));
    }

    let days = active
        .iter()
        .map(|day| {
            let lectures = (1..=LECTURES_PER_DAY)
                .filter_map(|n| {
                    let time = lecture_times[usize::from(n) - 1].clone()?;
                    let (subject_id, subject_code, subject_name) = by_cell
                        .get(&(day.code().to_string(), i64::from(n)))
                        .cloned()
                        .unwrap_or((None, None, None));
                    Some(LectureCell {
                        lecture_number: n,
                        time,
                        subject_id,
                        subject_code,
                        subject_name,
                    })
                })
                .collect();
            DaySchedule {
                day: day.code(),
                label: day.label(),
                lectures,
            }
        })
        .collect();

    Ok(Some(TimetableView {
        id: timetable_id.to_string(),
        degree_id,
        section,
        semester,
        lecture_times,
        lecture_subject_ids,
        lunch,
        active_days: active.iter().map(|d| d.code()).collect(),
        days,
    }))
}

/// Timetable for a student's degree and section. A semester-specific
/// timetable wins over a semester-less one.
pub fn find_for_student(conn: &Connection, student_id: &str) -> CoreResult<Option<String>> {
    let student: Option<(Option<String>, Option<String>, i64)> = conn
        .query_row(
            "SELECT degree_id, section, semester FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((degree_id, section, semester)) = student else {
        return Err(CoreError::not_found("student not found"));
    };
    let (Some(degree_id), Some(section)) = (degree_id, section) else {
        return Ok(None);
    };
    let id = conn
        .query_row(
            "SELECT id FROM timetables
             WHERE degree_id = ?1 AND section = ?2 COLLATE NOCASE
               AND (semester = ?3 OR semester IS NULL)
             ORDER BY semester IS NULL, rowid
             LIMIT 1",
            (&degree_id, section.trim(), semester),
            |r| r.get::<_, String>(0),
        )
        .optional()?;
    Ok(id)
}
