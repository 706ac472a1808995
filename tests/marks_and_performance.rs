mod test_support;

use serde_json::json;
use test_support::{open_campus, request_err, request_ok, spawn_sidecar, str_field, temp_dir};

fn enrollment_for(list: &serde_json::Value, code: &str) -> String {
    let row = list["enrollments"]
        .as_array()
        .expect("enrollments")
        .iter()
        .find(|e| e["subjectCode"] == code)
        .unwrap_or_else(|| panic!("no enrollment for {}", code));
    str_field(row, "enrollmentId")
}

#[test]
fn totals_follow_components_and_roles() {
    let workspace = temp_dir("erpd-marks");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let campus = open_campus(&mut stdin, &mut reader, &workspace);

    let mut subject_ids = Vec::new();
    for (code, is_lab, credits) in [("CS301", false, 3), ("CS351L", true, 2), ("CS302", false, 4)] {
        let subject = request_ok(
            &mut stdin,
            &mut reader,
            code,
            "subjects.create",
            json!({
                "name": code,
                "code": code,
                "semester": 3,
                "departmentId": campus.department_id,
                "credits": credits,
                "isLab": is_lab
            }),
        );
        subject_ids.push(str_field(&subject, "subjectId"));
    }
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "t1",
        "teachers.create",
        json!({ "fullName": "Owner", "employeeId": "E1", "subjectIds": subject_ids }),
    );
    let teacher_id = str_field(&teacher, "teacherId");
    let outsider = request_ok(
        &mut stdin,
        &mut reader,
        "t2",
        "teachers.create",
        json!({ "fullName": "Outsider", "employeeId": "E2" }),
    );
    let outsider_id = str_field(&outsider, "teacherId");

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
    let list = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "enrollment.list",
        json!({ "studentId": student_ids[0] }),
    );
    let theory = enrollment_for(&list, "CS301");
    let lab = enrollment_for(&list, "CS351L");

    // Internal marks by the owning teacher: total stays null without externals.
    request_ok(
        &mut stdin,
        &mut reader,
        "sess-t",
        "session.open",
        json!({ "role": "teacher", "teacherId": teacher_id }),
    );
    let set = request_ok(
        &mut stdin,
        &mut reader,
        "mi",
        "marks.setInternal",
        json!({ "enrollmentId": theory, "marks": { "mid1": 25, "mid2": 28, "put": 60 } }),
    );
    assert!(set["totalMarks"].is_null());
    request_ok(
        &mut stdin,
        &mut reader,
        "ml",
        "marks.setInternal",
        json!({ "enrollmentId": lab, "marks": { "practical": 35 } }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "bad-mid",
            "marks.setInternal",
            json!({ "enrollmentId": theory, "marks": { "mid1": 31 } })
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "bad-kind",
            "marks.setInternal",
            json!({ "enrollmentId": theory, "marks": { "practical": 10 } })
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "t-ext",
            "marks.setExternal",
            json!({ "enrollmentId": theory, "value": 50 })
        ),
        "forbidden"
    );

    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "sheet",
        "marks.subjectSheet",
        json!({ "subjectId": subject_ids[0] }),
    );
    let rows = sheet["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["rollNumber"], "21CS001");
    assert_eq!(rows[0]["internal"], 26.08);
    assert_eq!(rows[0]["grade"], "N/A");

    request_ok(
        &mut stdin,
        &mut reader,
        "sess-o",
        "session.open",
        json!({ "role": "teacher", "teacherId": outsider_id }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "o-mi",
            "marks.setInternal",
            json!({ "enrollmentId": theory, "marks": { "mid1": 1 } })
        ),
        "forbidden"
    );

    // External marks by the enrolled student.
    request_ok(
        &mut stdin,
        &mut reader,
        "sess-other-student",
        "session.open",
        json!({ "role": "student", "studentId": student_ids[1] }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "other-ext",
            "marks.setExternal",
            json!({ "enrollmentId": theory, "value": 50 })
        ),
        "forbidden"
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "sess-s",
        "session.open",
        json!({ "role": "student", "studentId": student_ids[0] }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "ext-hi",
            "marks.setExternal",
            json!({ "enrollmentId": theory, "value": 71 })
        ),
        "bad_params"
    );
    let ext = request_ok(
        &mut stdin,
        &mut reader,
        "ext",
        "marks.setExternal",
        json!({ "enrollmentId": theory, "value": 62 }),
    );
    assert_eq!(ext["totalMarks"], 88.08);
    let ext = request_ok(
        &mut stdin,
        &mut reader,
        "ext-lab",
        "marks.setExternal",
        json!({ "enrollmentId": lab, "value": 60 }),
    );
    assert_eq!(ext["totalMarks"], 95.0);

    let report = request_ok(&mut stdin, &mut reader, "perf", "performance.student", json!({}));
    assert_eq!(report["semester"], 3);
    // CS302 has no externals and stays out of the weighted average.
    assert_eq!(report["sgpa"], 9.4);
    assert_eq!(report["cgpa"], 9.4);
    let subjects = report["subjects"].as_array().expect("subjects");
    let by_code = |code: &str| {
        subjects
            .iter()
            .find(|s| s["subjectCode"] == code)
            .cloned()
            .expect("subject row")
    };
    assert_eq!(by_code("CS301")["grade"], "A");
    assert_eq!(by_code("CS351L")["percentage"], 86.36);
    assert_eq!(by_code("CS351L")["maxMarks"], 110.0);
    assert_eq!(by_code("CS302")["grade"], "N/A");
    assert!(by_code("CS302")["total"].is_null());

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "peek",
            "performance.student",
            json!({ "studentId": student_ids[1] })
        ),
        "forbidden"
    );

    let snap = request_ok(&mut stdin, &mut reader, "snap", "performance.snapshot", json!({}));
    assert_eq!(snap["sgpa"], 9.4);

    // Flipping the subject kind re-derives stored totals.
    request_ok(&mut stdin, &mut reader, "sess-a", "session.open", json!({ "role": "admin" }));
    let flipped = request_ok(
        &mut stdin,
        &mut reader,
        "flip",
        "subjects.update",
        json!({ "subjectId": subject_ids[0], "patch": { "isLab": true } }),
    );
    assert_eq!(flipped["recomputedTotals"], 2);
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "perf2",
        "performance.student",
        json!({ "studentId": student_ids[0] }),
    );
    let cs301 = report["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .find(|s| s["subjectCode"] == "CS301")
        .cloned()
        .expect("CS301");
    assert_eq!(cs301["total"], 62.0);

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "hist",
        "performance.history",
        json!({ "studentId": student_ids[0] }),
    );
    assert_eq!(history["history"].as_array().map(|h| h.len()), Some(1));
    assert_eq!(history["history"][0]["sgpa"], 9.4);

    // Clearing the external mark takes the total back to unrecorded.
    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "ext-clear",
        "marks.setExternal",
        json!({ "enrollmentId": lab, "value": null }),
    );
    assert!(cleared["totalMarks"].is_null());
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "perf3",
        "performance.student",
        json!({ "studentId": student_ids[0] }),
    );
    let cs351l = report["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .find(|s| s["subjectCode"] == "CS351L")
        .cloned()
        .expect("CS351L");
    assert!(cs351l["total"].is_null());
    assert_eq!(cs351l["grade"], "N/A");
}
