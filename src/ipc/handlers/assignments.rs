use crate::ipc::helpers::{
    check_bonus, db_conn, get_max_score, get_optional_score, get_optional_str, get_required_str,
    now, require_exists, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn assignments_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject = get_required_str(params, "subject")?;
    let title = get_required_str(params, "title")?;
    let term = get_required_str(params, "term")?;
    let academic_year = get_required_str(params, "academicYear")?;
    let max_score = get_max_score(params)?;
    require_exists(conn, "classes", &class_id, "class")?;

    let assignment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assignments(id, class_id, subject, title, max_score, term, academic_year, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &assignment_id,
            &class_id,
            &subject,
            &title,
            max_score,
            &term,
            &academic_year,
            now(),
        ),
    )
    .map_err(|e| HandlerErr::update("assignments", e))?;

    Ok(json!({ "assignmentId": assignment_id }))
}

fn assignments_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let mut sql = String::from(
        "SELECT id, class_id, subject, title, max_score, term, academic_year, created_at
         FROM assignments WHERE active = 1 AND class_id = ?",
    );
    let mut binds: Vec<SqlValue> = vec![SqlValue::Text(class_id)];
    for (key, col) in [
        ("subject", "subject"),
        ("term", "term"),
        ("academicYear", "academic_year"),
    ] {
        if let Some(v) = get_optional_str(params, key)? {
            sql.push_str(&format!(" AND {} = ?", col));
            binds.push(SqlValue::Text(v));
        }
    }
    sql.push_str(" ORDER BY created_at, id");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let assignments = stmt
        .query_map(params_from_iter(binds), |r| {
            let id: String = r.get(0)?;
            let class_id: String = r.get(1)?;
            let subject: String = r.get(2)?;
            let title: String = r.get(3)?;
            let max_score: f64 = r.get(4)?;
            let term: String = r.get(5)?;
            let academic_year: String = r.get(6)?;
            let created_at: String = r.get(7)?;
            Ok(json!({
                "id": id,
                "classId": class_id,
                "subject": subject,
                "title": title,
                "maxScore": max_score,
                "term": term,
                "academicYear": academic_year,
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "assignments": assignments }))
}

/// Soft delete: submissions are kept but no longer count toward averages.
fn assignments_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let n = conn
        .execute(
            "UPDATE assignments SET active = 0 WHERE id = ?",
            [&assignment_id],
        )
        .map_err(|e| HandlerErr::update("assignments", e))?;
    if n == 0 {
        return Err(HandlerErr::new("not_found", "assignment not found"));
    }
    Ok(json!({ "ok": true }))
}

/// `rawScore: null` (or absent) records "not submitted".
fn submissions_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let student_id = get_required_str(params, "studentId")?;
    let raw_score = get_optional_score(params, "rawScore")?;

    let max_score: Option<f64> = conn
        .query_row(
            "SELECT max_score FROM assignments WHERE id = ? AND active = 1",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(max_score) = max_score else {
        return Err(HandlerErr::new("not_found", "assignment not found"));
    };
    require_exists(conn, "students", &student_id, "student")?;
    if let Some(raw) = raw_score {
        check_bonus(params, raw, max_score)?;
    }

    conn.execute(
        "INSERT INTO submissions(id, assignment_id, student_id, raw_score, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(assignment_id, student_id) DO UPDATE SET
           raw_score = excluded.raw_score,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &assignment_id,
            &student_id,
            raw_score,
            now(),
        ),
    )
    .map_err(|e| HandlerErr::update("submissions", e))?;

    Ok(json!({
        "assignmentId": assignment_id,
        "studentId": student_id,
        "rawScore": raw_score,
        "submitted": raw_score.is_some()
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = match req.method.as_str() {
        "assignments.create" => assignments_create,
        "assignments.list" => assignments_list,
        "assignments.delete" => assignments_delete,
        "submissions.record" => submissions_record,
        _ => return None,
    };
    let result = db_conn(state).and_then(|conn| run(conn, &req.params));
    Some(respond(req, result))
}
