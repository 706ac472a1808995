mod test_support;

use serde_json::json;
use test_support::{open_campus, request_err, request_ok, spawn_sidecar, str_field, temp_dir};

#[test]
fn setup_sections_persist_across_restarts() {
    let workspace = temp_dir("erpd-setup");
    {
        let (_child, mut stdin, mut reader) = spawn_sidecar();
        open_campus(&mut stdin, &mut reader, &workspace);

        let defaults = request_ok(&mut stdin, &mut reader, "1", "setup.get", json!({}));
        assert_eq!(defaults["enrollment"]["autoEnrollOnSave"], true);
        assert_eq!(defaults["attendance"]["shortageThresholdPercent"], 75);
        assert_eq!(
            defaults["timetable"]["defaultActiveDays"],
            "mon,tue,wed,thu,fri,sat"
        );

        assert_eq!(
            request_err(
                &mut stdin,
                &mut reader,
                "2",
                "setup.update",
                json!({ "section": "attendance", "patch": { "shortageThresholdPercent": 101 } })
            ),
            "bad_params"
        );
        assert_eq!(
            request_err(
                &mut stdin,
                &mut reader,
                "3",
                "setup.update",
                json!({ "section": "timetable", "patch": { "defaultActiveDays": "mon,sun" } })
            ),
            "bad_params"
        );
        request_ok(
            &mut stdin,
            &mut reader,
            "4",
            "setup.update",
            json!({ "section": "attendance", "patch": { "shortageThresholdPercent": 60 } }),
        );
        request_ok(
            &mut stdin,
            &mut reader,
            "5",
            "setup.update",
            json!({ "section": "timetable", "patch": { "defaultActiveDays": "mon,tue,wed,thu,fri" } }),
        );
    }

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let setup = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(setup["attendance"]["shortageThresholdPercent"], 60);
    assert_eq!(setup["timetable"]["defaultActiveDays"], "mon,tue,wed,thu,fri");
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "3",
            "setup.update",
            json!({ "section": "enrollment", "patch": { "autoEnrollOnSave": false } })
        ),
        "no_session"
    );
}

#[test]
fn attendance_marks_upsert_and_flag_shortage() {
    let workspace = temp_dir("erpd-attendance");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let campus = open_campus(&mut stdin, &mut reader, &workspace);

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "sub",
        "subjects.create",
        json!({ "name": "Databases", "code": "CS304", "semester": 3, "departmentId": campus.department_id }),
    );
    let subject_id = str_field(&subject, "subjectId");

    // Students exist before the teacher is assigned, so nothing is enrolled yet.
    let mut student_ids = Vec::new();
    for roll in ["21CS001", "21CS002"] {
        let student = request_ok(
            &mut stdin,
            &mut reader,
            roll,
            "students.create",
            json!({ "fullName": roll, "rollNumber": roll, "semester": 3, "departmentId": campus.department_id }),
        );
        student_ids.push(str_field(&student, "studentId"));
    }
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "t",
        "teachers.create",
        json!({ "fullName": "Mentor", "employeeId": "E9", "subjectIds": [subject_id] }),
    );
    let teacher_id = str_field(&teacher, "teacherId");

    request_ok(
        &mut stdin,
        &mut reader,
        "sess",
        "session.open",
        json!({ "role": "teacher", "teacherId": teacher_id }),
    );
    let days = ["2024-07-01", "2024-07-02", "2024-07-03", "2024-07-04"];
    for (i, date) in days.iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("mark{}", i),
            "attendance.mark",
            json!({
                "subjectId": subject_id,
                "date": date,
                "entries": [
                    { "studentId": student_ids[0], "present": true },
                    { "studentId": student_ids[1], "present": i == 0 }
                ]
            }),
        );
    }
    // Re-marking a day overwrites instead of duplicating.
    request_ok(
        &mut stdin,
        &mut reader,
        "remark",
        "attendance.mark",
        json!({
            "subjectId": subject_id,
            "date": "2024-07-04",
            "entries": [{ "studentId": student_ids[1], "present": true }]
        }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "bad-date",
            "attendance.mark",
            json!({ "subjectId": subject_id, "date": "04/07/2024", "entries": [] })
        ),
        "bad_params"
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "report",
        "attendance.subjectReport",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(report["classDays"], 4);
    let rows = report["students"].as_array().expect("students");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["percentage"], 100.0);
    assert_eq!(rows[0]["shortage"], false);
    assert_eq!(rows[1]["present"], 2);
    assert_eq!(rows[1]["total"], 4);
    assert_eq!(rows[1]["percentage"], 50.0);
    assert_eq!(rows[1]["shortage"], true);

    let windowed = request_ok(
        &mut stdin,
        &mut reader,
        "window",
        "attendance.subjectReport",
        json!({ "subjectId": subject_id, "from": "2024-07-02", "to": "2024-07-03" }),
    );
    assert_eq!(windowed["classDays"], 2);
    assert_eq!(windowed["students"][1]["present"], 0);

    request_ok(
        &mut stdin,
        &mut reader,
        "sess-s",
        "session.open",
        json!({ "role": "student", "studentId": student_ids[1] }),
    );
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "summary",
        "attendance.studentSummary",
        json!({}),
    );
    assert_eq!(summary["overall"]["percentage"], 50.0);
    assert_eq!(summary["subjects"][0]["subjectCode"], "CS304");
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "student-mark",
            "attendance.mark",
            json!({ "subjectId": subject_id, "date": "2024-07-05", "entries": [] })
        ),
        "forbidden"
    );
}
