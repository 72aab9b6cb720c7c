mod test_support;

use serde_json::json;
use test_support::{
    key_params, request_err, request_ok, seed_class_with_student, select_workspace, spawn_sidecar,
    temp_dir, with,
};

#[test]
fn classes_and_students_crud() {
    let workspace = temp_dir("carrymark-classes");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let (class_id, _student_id) = seed_class_with_student(&mut stdin, &mut reader);

    let classes = request_ok(&mut stdin, &mut reader, "1", "classes.list", json!({}));
    assert_eq!(classes["classes"][0]["id"], class_id.as_str());
    assert_eq!(classes["classes"][0]["studentCount"], 1);
    assert_eq!(classes["classes"][0]["form"], "4");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "classId": class_id, "name": "Arif", "studentNo": "S-0042" }),
    );
    let students = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.list",
        json!({ "classId": class_id }),
    );
    let names: Vec<&str> = students["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["name"].as_str())
        .collect();
    assert_eq!(names, vec!["Aisyah", "Arif"]);
    assert_eq!(students["students"][1]["studentNo"], "S-0042");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "classId": "missing", "name": "Nobody" }),
    );
    assert_eq!(code, "not_found");
    let code = request_err(&mut stdin, &mut reader, "5", "classes.create", json!({ "name": "  " }));
    assert_eq!(code, "bad_params");
}

#[test]
fn assessment_scores_upsert_per_type_and_validate() {
    let workspace = temp_dir("carrymark-assessments");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let (class_id, student_id) = seed_class_with_student(&mut stdin, &mut reader);
    let key = key_params(&class_id, &student_id);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "assessments.record",
        with(&key, json!({ "assessmentType": "US1", "rawScore": 40, "maxScore": 50 })),
    );
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assessments.record",
        with(&key, json!({ "assessmentType": "us1", "rawScore": 45, "maxScore": 50 })),
    );
    assert_eq!(first["assessmentId"], again["assessmentId"]);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assessments.list",
        json!({ "studentId": student_id, "assessmentType": "US1" }),
    );
    let rows = listed["assessments"].as_array().expect("assessments");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["rawScore"], 45.0);
    assert_eq!(rows[0]["assessmentType"], "US1");

    for (id, extra, expected) in [
        ("4", json!({ "assessmentType": "QUIZ", "rawScore": 1 }), "bad_params"),
        ("5", json!({ "assessmentType": "US2", "rawScore": -1 }), "bad_params"),
        ("6", json!({ "assessmentType": "US2", "rawScore": 10, "maxScore": 0 }), "bad_params"),
        ("7", json!({ "assessmentType": "US2", "rawScore": 110 }), "bad_params"),
        ("8", json!({ "assessmentType": "US2" }), "bad_params"),
    ] {
        let code = request_err(&mut stdin, &mut reader, id, "assessments.record", with(&key, extra));
        assert_eq!(code, expected, "request {}", id);
    }

    let bonus = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "assessments.record",
        with(&key, json!({ "assessmentType": "US2", "rawScore": 110, "allowBonus": true })),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "assessments.delete",
        json!({ "assessmentId": bonus["assessmentId"] }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "assessments.delete",
        json!({ "assessmentId": bonus["assessmentId"] }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn retired_assignments_and_missing_submissions_do_not_count() {
    let workspace = temp_dir("carrymark-assignments");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let (class_id, student_id) = seed_class_with_student(&mut stdin, &mut reader);
    let key = key_params(&class_id, &student_id);

    let mut ids = Vec::new();
    for (i, title) in ["Essay", "Project", "Quiz"].into_iter().enumerate() {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("a{}", i),
            "assignments.create",
            json!({
                "classId": class_id,
                "subject": "Mathematics",
                "title": title,
                "term": "1",
                "academicYear": "2024"
            }),
        );
        ids.push(created["assignmentId"].as_str().expect("assignmentId").to_string());
    }
    // 80 counts; the project is not submitted; the quiz is retired below.
    for (i, (assignment, score)) in [(&ids[0], json!(80)), (&ids[1], json!(null)), (&ids[2], json!(10))]
        .into_iter()
        .enumerate()
    {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "submissions.record",
            json!({ "assignmentId": assignment, "studentId": student_id, "rawScore": score }),
        );
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "assignments.delete",
        json!({ "assignmentId": ids[2] }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "assignments.list",
        json!({ "classId": class_id, "subject": "Mathematics" }),
    );
    assert_eq!(listed["assignments"].as_array().map(|a| a.len()), Some(2));

    let out = request_ok(&mut stdin, &mut reader, "rc", "carryMarks.recompute", key);
    assert_eq!(out["record"]["assignmentAverage"], 80.0);
    assert!(out["record"]["assessmentAverage"].is_null());

    let code = request_err(
        &mut stdin,
        &mut reader,
        "late",
        "submissions.record",
        json!({ "assignmentId": ids[2], "studentId": student_id, "rawScore": 5 }),
    );
    assert_eq!(code, "not_found");
}

#[test]
fn attendance_marking_and_range_listing() {
    let workspace = temp_dir("carrymark-attendance");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let (class_id, student_id) = seed_class_with_student(&mut stdin, &mut reader);
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "s2",
        "students.create",
        json!({ "classId": class_id, "name": "Badrul" }),
    );
    let other_id = other["studentId"].as_str().expect("studentId").to_string();

    for (i, date) in ["2024-02-01", "2024-02-02", "2024-02-05"].into_iter().enumerate() {
        let out = request_ok(
            &mut stdin,
            &mut reader,
            &format!("mc{}", i),
            "attendance.markClass",
            json!({
                "classId": class_id,
                "date": date,
                "term": "1",
                "academicYear": "2024",
                "entries": [
                    { "studentId": student_id, "status": "Present" },
                    { "studentId": other_id, "status": if i == 0 { "late" } else { "absent" } }
                ]
            }),
        );
        assert_eq!(out["marked"], 2);
    }
    // Re-marking a day replaces the earlier status.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "fix",
        "attendance.mark",
        json!({
            "studentId": other_id,
            "classId": class_id,
            "date": "2024-02-05",
            "status": "present",
            "term": "1",
            "academicYear": "2024"
        }),
    );

    let ranged = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "attendance.list",
        json!({ "studentId": other_id, "from": "2024-02-02", "to": "2024-02-05" }),
    );
    let statuses: Vec<&str> = ranged["entries"]
        .as_array()
        .expect("entries")
        .iter()
        .filter_map(|e| e["status"].as_str())
        .collect();
    assert_eq!(statuses, vec!["absent", "present"]);

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "rc",
        "carryMarks.recompute",
        key_params(&class_id, &other_id),
    );
    // late + absent + present -> 2 of 3 count as attended.
    assert_eq!(out["record"]["attendancePercentage"], json!(200.0 / 3.0));
    assert_eq!(out["record"]["finalScore"], 66.67);

    // A bad entry rejects the whole batch.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "bad",
        "attendance.markClass",
        json!({
            "classId": class_id,
            "date": "2024-02-06",
            "term": "1",
            "academicYear": "2024",
            "entries": [
                { "studentId": student_id, "status": "present" },
                { "studentId": other_id, "status": "excused" }
            ]
        }),
    );
    assert_eq!(code, "bad_params");
    let day = request_ok(
        &mut stdin,
        &mut reader,
        "after",
        "attendance.list",
        json!({ "classId": class_id, "from": "2024-02-06", "to": "2024-02-06" }),
    );
    assert_eq!(day["entries"], json!([]));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "date",
        "attendance.list",
        json!({ "from": "06/02/2024" }),
    );
    assert_eq!(code, "bad_params");
}
