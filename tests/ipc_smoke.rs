mod test_support;

use serde_json::json;
use std::io::{BufRead, Write};
use test_support::{request, request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn health_and_session_lifecycle() {
    let workspace = temp_dir("erpd-smoke");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health["workspacePath"].is_null());

    assert_eq!(
        request_err(&mut stdin, &mut reader, "2", "departments.list", json!({})),
        "no_workspace"
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert!(workspace.join("erp.sqlite3").exists());

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "4",
            "departments.create",
            json!({ "name": "Civil", "code": "CE" })
        ),
        "no_session"
    );

    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "session.open",
        json!({ "role": "admin" }),
    );
    assert_eq!(opened["session"]["role"], "admin");

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "6",
            "session.open",
            json!({ "role": "teacher", "teacherId": "nobody" })
        ),
        "not_found"
    );

    let current = request_ok(&mut stdin, &mut reader, "7", "session.current", json!({}));
    assert_eq!(current["session"]["role"], "admin");

    request_ok(&mut stdin, &mut reader, "8", "session.close", json!({}));
    let current = request_ok(&mut stdin, &mut reader, "9", "session.current", json!({}));
    assert!(current["session"].is_null());
}

#[test]
fn unknown_methods_and_bad_json_are_reported() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let resp = request(&mut stdin, &mut reader, "1", "grades.explode", json!({}));
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "not_implemented");

    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(value["error"]["code"], "bad_json");

    // The daemon keeps serving after a malformed line.
    request_ok(&mut stdin, &mut reader, "2", "health", json!({}));
}

#[test]
fn catalog_writes_are_admin_only_and_unique() {
    let workspace = temp_dir("erpd-catalog");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let campus = test_support::open_campus(&mut stdin, &mut reader, &workspace);

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "1",
            "departments.create",
            json!({ "name": "Duplicate", "code": "CSE" })
        ),
        "conflict"
    );

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "fullName": "R. Rao", "employeeId": "EMP-1", "departmentId": campus.department_id }),
    );
    let teacher_id = test_support::str_field(&teacher, "teacherId");
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "session.open",
        json!({ "role": "teacher", "teacherId": teacher_id }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "4",
            "subjects.create",
            json!({ "name": "Compilers", "code": "CS501", "semester": 5, "departmentId": campus.department_id })
        ),
        "forbidden"
    );

    request_ok(&mut stdin, &mut reader, "5", "session.open", json!({ "role": "admin" }));
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "6",
            "subjects.create",
            json!({ "name": "Compilers", "code": "CS501", "semester": 9, "departmentId": campus.department_id })
        ),
        "bad_params"
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.create",
        json!({ "name": "Compilers", "code": "CS501", "semester": 5, "departmentId": campus.department_id }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "8",
            "departments.delete",
            json!({ "departmentId": campus.department_id })
        ),
        "conflict"
    );

    let departments = request_ok(&mut stdin, &mut reader, "9", "departments.list", json!({}));
    let rows = departments["departments"].as_array().expect("departments");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["code"], "CSE");
    assert_eq!(rows[0]["subjectCount"], 1);
}
