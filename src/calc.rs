use crate::error::{CoreError, CoreResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

pub const MID_MAX: f64 = 30.0;
pub const PUT_MAX: f64 = 70.0;
pub const PRACTICAL_MAX: f64 = 40.0;
pub const EXTERNAL_MAX: f64 = 70.0;

/// Raw theory internal ceiling: mid1 (30) + mid2 (30) + put (70).
pub const THEORY_RAW_INTERNAL_MAX: f64 = MID_MAX + MID_MAX + PUT_MAX;
/// Theory internals are rescaled onto this ceiling.
pub const THEORY_INTERNAL_MAX: f64 = 30.0;
/// Lab internals are entered on this scale already.
pub const LAB_INTERNAL_MAX: f64 = PRACTICAL_MAX;

pub const NO_GRADE: &str = "N/A";

/// Half-away-from-zero rounding to 2 decimals.
pub fn round_2dp(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn grade_point(marks: f64) -> u8 {
    if marks >= 90.0 {
        10
    } else if marks >= 80.0 {
        9
    } else if marks >= 70.0 {
        8
    } else if marks >= 60.0 {
        7
    } else if marks >= 50.0 {
        6
    } else if marks >= 40.0 {
        5
    } else {
        0
    }
}

pub fn letter_grade(obtained: Option<f64>, maximum: Option<f64>) -> &'static str {
    let (Some(obtained), Some(maximum)) = (obtained, maximum) else {
        return NO_GRADE;
    };
    if maximum == 0.0 {
        return NO_GRADE;
    }
    let percent = 100.0 * obtained / maximum;
    if percent >= 90.0 {
        "A+"
    } else if percent >= 80.0 {
        "A"
    } else if percent >= 70.0 {
        "B+"
    } else if percent >= 60.0 {
        "B"
    } else if percent >= 50.0 {
        "C"
    } else if percent >= 40.0 {
        "D"
    } else {
        "F"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubjectKind {
    Theory,
    Lab,
}

impl SubjectKind {
    pub fn from_is_lab(is_lab: bool) -> Self {
        if is_lab {
            Self::Lab
        } else {
            Self::Theory
        }
    }

    pub fn internal_max(self) -> f64 {
        match self {
            Self::Theory => THEORY_INTERNAL_MAX,
            Self::Lab => LAB_INTERNAL_MAX,
        }
    }

    /// Display maximum: internal ceiling plus the external paper.
    pub fn total_max(self) -> f64 {
        self.internal_max() + EXTERNAL_MAX
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkComponent {
    Mid1,
    Mid2,
    Put,
    Practical,
    External,
}

impl MarkComponent {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mid1" => Some(Self::Mid1),
            "mid2" => Some(Self::Mid2),
            "put" => Some(Self::Put),
            "practical" => Some(Self::Practical),
            "external" => Some(Self::External),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Mid1 => "mid1",
            Self::Mid2 => "mid2",
            Self::Put => "put",
            Self::Practical => "practical",
            Self::External => "external",
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            Self::Mid1 => "mid1_marks",
            Self::Mid2 => "mid2_marks",
            Self::Put => "put_marks",
            Self::Practical => "practical_marks",
            Self::External => "external_marks",
        }
    }

    pub fn max(self) -> f64 {
        match self {
            Self::Mid1 | Self::Mid2 => MID_MAX,
            Self::Put => PUT_MAX,
            Self::Practical => PRACTICAL_MAX,
            Self::External => EXTERNAL_MAX,
        }
    }

    pub fn applies_to(self, kind: SubjectKind) -> bool {
        match self {
            Self::Mid1 | Self::Mid2 | Self::Put => kind == SubjectKind::Theory,
            Self::Practical => kind == SubjectKind::Lab,
            Self::External => true,
        }
    }

    /// Boundary check for entered marks. `None` clears the component.
    pub fn validate(self, kind: SubjectKind, value: Option<f64>) -> CoreResult<Option<f64>> {
        if !self.applies_to(kind) {
            return Err(CoreError::invalid(format!(
                "{} marks do not apply to {} subjects",
                self.key(),
                match kind {
                    SubjectKind::Theory => "theory",
                    SubjectKind::Lab => "lab",
                }
            )));
        }
        let Some(v) = value else {
            return Ok(None);
        };
        if !v.is_finite() || v < 0.0 || v > self.max() {
            return Err(CoreError::invalid(format!(
                "{} must be between 0 and {}",
                self.key(),
                self.max()
            )));
        }
        Ok(Some(v))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMarks {
    pub mid1: Option<f64>,
    pub mid2: Option<f64>,
    pub put: Option<f64>,
    pub practical: Option<f64>,
    pub external: Option<f64>,
}

pub fn internal_subtotal(kind: SubjectKind, marks: &ComponentMarks) -> f64 {
    match kind {
        SubjectKind::Lab => marks.practical.unwrap_or(0.0),
        SubjectKind::Theory => {
            let raw = marks.mid1.unwrap_or(0.0) + marks.mid2.unwrap_or(0.0) + marks.put.unwrap_or(0.0);
            round_2dp(raw / THEORY_RAW_INTERNAL_MAX * THEORY_INTERNAL_MAX)
        }
    }
}

/// Null until external marks exist; never defaults external to zero.
pub fn combined_total(kind: SubjectKind, marks: &ComponentMarks) -> Option<f64> {
    marks
        .external
        .map(|external| round_2dp(internal_subtotal(kind, marks) + external))
}

pub fn percentage(kind: SubjectKind, total: Option<f64>) -> Option<f64> {
    total.map(|t| round_2dp(100.0 * t / kind.total_max()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpaScope {
    Semester(i64),
    UpTo(i64),
}

impl GpaScope {
    fn includes(self, semester: i64) -> bool {
        match self {
            Self::Semester(s) => semester == s,
            Self::UpTo(s) => semester <= s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradedSubject {
    pub semester: i64,
    pub credits: i64,
    pub total_marks: Option<f64>,
}

/// Credit-weighted grade-point mean. Subjects without a total carry no weight.
pub fn weighted_grade_average(rows: &[GradedSubject], scope: GpaScope) -> f64 {
    let mut weighted_sum = 0.0_f64;
    let mut total_credits = 0_i64;
    for row in rows.iter().filter(|r| scope.includes(r.semester)) {
        let Some(total) = row.total_marks else {
            continue;
        };
        weighted_sum += f64::from(grade_point(total)) * row.credits as f64;
        total_credits += row.credits;
    }
    if total_credits > 0 {
        round_2dp(weighted_sum / total_credits as f64)
    } else {
        0.0
    }
}

pub fn sgpa(rows: &[GradedSubject], semester: i64) -> f64 {
    weighted_grade_average(rows, GpaScope::Semester(semester))
}

pub fn cgpa(rows: &[GradedSubject], up_to_semester: i64) -> f64 {
    weighted_grade_average(rows, GpaScope::UpTo(up_to_semester))
}

pub fn attendance_percentage(present: i64, total: i64) -> f64 {
    if total > 0 {
        round_2dp(present as f64 / total as f64 * 100.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub enrollment_id: String,
    pub subject_id: String,
    pub subject_code: String,
    pub subject_name: String,
    pub semester: i64,
    pub credits: i64,
    pub kind: SubjectKind,
    pub marks: ComponentMarks,
    pub internal: f64,
    pub total: Option<f64>,
    pub max_marks: f64,
    pub percentage: Option<f64>,
    pub grade: &'static str,
    pub grade_point: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPerformance {
    pub student_id: String,
    pub roll_number: String,
    pub semester: i64,
    pub subjects: Vec<SubjectResult>,
    pub total_obtained: f64,
    pub total_maximum: f64,
    pub overall_percentage: f64,
    pub sgpa: f64,
    pub cgpa: f64,
}

pub fn load_subject_results(conn: &Connection, student_id: &str) -> CoreResult<Vec<SubjectResult>> {
    let mut stmt = conn.prepare(
        "SELECT e.id, s.id, s.code, s.name, s.semester, s.credits, s.is_lab,
                e.mid1_marks, e.mid2_marks, e.put_marks, e.practical_marks,
                e.external_marks, e.total_marks
         FROM subject_enrollments e
         JOIN subjects s ON s.id = e.subject_id
         WHERE e.student_id = ?
         ORDER BY s.semester, s.code",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            let kind = SubjectKind::from_is_lab(r.get::<_, i64>(6)? != 0);
            let marks = ComponentMarks {
                mid1: r.get(7)?,
                mid2: r.get(8)?,
                put: r.get(9)?,
                practical: r.get(10)?,
                external: r.get(11)?,
            };
            let total: Option<f64> = r.get(12)?;
            Ok(SubjectResult {
                enrollment_id: r.get(0)?,
                subject_id: r.get(1)?,
                subject_code: r.get(2)?,
                subject_name: r.get(3)?,
                semester: r.get(4)?,
                credits: r.get(5)?,
                kind,
                marks,
                internal: internal_subtotal(kind, &marks),
                total,
                max_marks: kind.total_max(),
                percentage: percentage(kind, total),
                grade: letter_grade(total, Some(kind.total_max())),
                grade_point: total.map(grade_point),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Builds the report for `semester`, or the student's current semester.
/// Subject rows cover that semester only; CGPA spans every semester up to it.
pub fn compute_student_performance(
    conn: &Connection,
    student_id: &str,
    semester: Option<i64>,
) -> CoreResult<StudentPerformance> {
    let student: Option<(String, i64)> = conn
        .query_row(
            "SELECT roll_number, semester FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((roll_number, current_semester)) = student else {
        return Err(CoreError::not_found("student not found"));
    };
    let semester = semester.unwrap_or(current_semester);

    let all = load_subject_results(conn, student_id)?;
    let graded: Vec<GradedSubject> = all
        .iter()
        .map(|r| GradedSubject {
            semester: r.semester,
            credits: r.credits,
            total_marks: r.total,
        })
        .collect();
    let sgpa_value = sgpa(&graded, semester);
    let cgpa_value = cgpa(&graded, semester);

    let subjects: Vec<SubjectResult> = all.into_iter().filter(|r| r.semester == semester).collect();
    let total_obtained: f64 = subjects.iter().filter_map(|r| r.total).sum();
    let total_maximum: f64 = subjects.iter().map(|r| r.max_marks).sum();
    let overall_percentage = if total_maximum > 0.0 {
        round_2dp(100.0 * total_obtained / total_maximum)
    } else {
        0.0
    };

    Ok(StudentPerformance {
        student_id: student_id.to_string(),
        roll_number,
        semester,
        subjects,
        total_obtained: round_2dp(total_obtained),
        total_maximum,
        overall_percentage,
        sgpa: sgpa_value,
        cgpa: cgpa_value,
    })
}

/// Recomputes the stored total of one enrollment from its current components.
pub fn refresh_enrollment_total(conn: &Connection, enrollment_id: &str) -> CoreResult<Option<f64>> {
    let row: Option<(bool, ComponentMarks)> = conn
        .query_row(
            "SELECT s.is_lab, e.mid1_marks, e.mid2_marks, e.put_marks, e.practical_marks, e.external_marks
             FROM subject_enrollments e
             JOIN subjects s ON s.id = e.subject_id
             WHERE e.id = ?",
            [enrollment_id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)? != 0,
                    ComponentMarks {
                        mid1: r.get(1)?,
                        mid2: r.get(2)?,
                        put: r.get(3)?,
                        practical: r.get(4)?,
                        external: r.get(5)?,
                    },
                ))
            },
        )
        .optional()?;
    let Some((is_lab, marks)) = row else {
        return Err(CoreError::not_found("enrollment not found"));
    };
    let total = combined_total(SubjectKind::from_is_lab(is_lab), &marks);
    conn.execute(
        "UPDATE subject_enrollments SET total_marks = ? WHERE id = ?",
        (total, enrollment_id),
    )?;
    Ok(total)
}

/// Re-derives every total for a subject, e.g. after its lab flag changed.
pub fn refresh_subject_totals(conn: &Connection, subject_id: &str) -> CoreResult<usize> {
    let mut stmt = conn.prepare("SELECT id FROM subject_enrollments WHERE subject_id = ?")?;
    let ids = stmt
        .query_map([subject_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for id in &ids {
        refresh_enrollment_total(conn, id)?;
    }
    Ok(ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn theory(mid1: Option<f64>, mid2: Option<f64>, put: Option<f64>) -> ComponentMarks {
        ComponentMarks {
            mid1,
            mid2,
            put,
            ..ComponentMarks::default()
        }
    }

    #[test]
    fn grade_point_breakpoints() {
        assert_eq!(grade_point(95.0), 10);
        assert_eq!(grade_point(90.0), 10);
        assert_eq!(grade_point(85.0), 9);
        assert_eq!(grade_point(70.0), 8);
        assert_eq!(grade_point(40.0), 5);
        assert_eq!(grade_point(39.0), 0);
        assert_eq!(grade_point(39.99), 0);
    }

    #[test]
    fn letter_grade_guards_missing_operands() {
        assert_eq!(letter_grade(None, Some(100.0)), "N/A");
        assert_eq!(letter_grade(Some(50.0), None), "N/A");
        assert_eq!(letter_grade(Some(50.0), Some(0.0)), "N/A");
        assert_eq!(letter_grade(Some(90.0), Some(100.0)), "A+");
        assert_eq!(letter_grade(Some(99.0), Some(110.0)), "A+");
        assert_eq!(letter_grade(Some(65.0), Some(100.0)), "B");
        assert_eq!(letter_grade(Some(10.0), Some(100.0)), "F");
    }

    #[test]
    fn theory_internal_rescales_to_thirty() {
        let full = theory(Some(30.0), Some(30.0), Some(70.0));
        assert_eq!(internal_subtotal(SubjectKind::Theory, &full), 30.0);
        let partial = theory(Some(15.0), Some(0.0), Some(0.0));
        assert_eq!(internal_subtotal(SubjectKind::Theory, &partial), 3.46);
        assert_eq!(
            internal_subtotal(SubjectKind::Theory, &ComponentMarks::default()),
            0.0
        );
    }

    #[test]
    fn lab_internal_is_not_rescaled() {
        let marks = ComponentMarks {
            practical: Some(35.0),
            ..ComponentMarks::default()
        };
        assert_eq!(internal_subtotal(SubjectKind::Lab, &marks), 35.0);
        assert_eq!(
            internal_subtotal(SubjectKind::Lab, &ComponentMarks::default()),
            0.0
        );
    }

    #[test]
    fn total_stays_null_until_external_entered() {
        let mut marks = theory(Some(30.0), Some(30.0), Some(70.0));
        assert_eq!(combined_total(SubjectKind::Theory, &marks), None);
        marks.external = Some(0.0);
        assert_eq!(combined_total(SubjectKind::Theory, &marks), Some(30.0));
        marks.external = Some(55.5);
        assert_eq!(combined_total(SubjectKind::Theory, &marks), Some(85.5));
    }

    #[test]
    fn percentage_uses_subject_type_maximum() {
        assert_eq!(percentage(SubjectKind::Theory, Some(85.0)), Some(85.0));
        assert_eq!(percentage(SubjectKind::Lab, Some(99.0)), Some(90.0));
        assert_eq!(percentage(SubjectKind::Lab, None), None);
    }

    #[test]
    fn component_validation_rejects_out_of_range_and_wrong_kind() {
        assert!(MarkComponent::Mid1
            .validate(SubjectKind::Theory, Some(31.0))
            .is_err());
        assert!(MarkComponent::Put
            .validate(SubjectKind::Theory, Some(-1.0))
            .is_err());
        assert!(MarkComponent::Practical
            .validate(SubjectKind::Theory, Some(10.0))
            .is_err());
        assert!(MarkComponent::Mid2
            .validate(SubjectKind::Lab, Some(10.0))
            .is_err());
        assert_eq!(
            MarkComponent::External
                .validate(SubjectKind::Lab, Some(70.0))
                .expect("valid"),
            Some(70.0)
        );
        assert_eq!(
            MarkComponent::Put
                .validate(SubjectKind::Theory, None)
                .expect("clear"),
            None
        );
    }

    #[test]
    fn sgpa_excludes_ungraded_subjects() {
        let rows = [
            GradedSubject {
                semester: 3,
                credits: 4,
                total_marks: Some(85.0),
            },
            GradedSubject {
                semester: 3,
                credits: 3,
                total_marks: None,
            },
        ];
        assert_eq!(sgpa(&rows, 3), 9.0);
    }

    #[test]
    fn cgpa_spans_semesters_up_to_target() {
        let rows = [
            GradedSubject {
                semester: 1,
                credits: 4,
                total_marks: Some(92.0),
            },
            GradedSubject {
                semester: 2,
                credits: 2,
                total_marks: Some(55.0),
            },
            GradedSubject {
                semester: 3,
                credits: 3,
                total_marks: Some(30.0),
            },
        ];
        // (10*4 + 6*2) / 6 = 8.666..
        assert_eq!(cgpa(&rows, 2), 8.67);
        // (40 + 12 + 0) / 9 = 5.777..
        assert_eq!(cgpa(&rows, 3), 5.78);
        assert_eq!(sgpa(&rows, 2), 6.0);
        assert_eq!(sgpa(&rows, 5), 0.0);
    }

    #[test]
    fn attendance_percentage_handles_empty() {
        assert_eq!(attendance_percentage(0, 0), 0.0);
        assert_eq!(attendance_percentage(2, 3), 66.67);
    }
}
