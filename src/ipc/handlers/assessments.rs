use crate::calc::AssessmentType;
use crate::ipc::helpers::{
    check_bonus, db_conn, get_max_score, get_optional_score, get_optional_str, get_required_str,
    now, require_exists, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::json;
use uuid::Uuid;

fn parse_type(raw: &str) -> Result<AssessmentType, HandlerErr> {
    AssessmentType::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params(format!(
            "assessmentType must be one of: {}",
            AssessmentType::ALL.map(|t| t.as_str()).join(", ")
        ))
    })
}

/// One score per (student, class, subject, type, term, year); recording the
/// same type again replaces the score.
fn assessments_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let class_id = get_required_str(params, "classId")?;
    let subject = get_required_str(params, "subject")?;
    let assessment_type = parse_type(&get_required_str(params, "assessmentType")?)?;
    let term = get_required_str(params, "term")?;
    let academic_year = get_required_str(params, "academicYear")?;
    let raw_score = get_optional_score(params, "rawScore")?
        .ok_or_else(|| HandlerErr::bad_params("missing rawScore"))?;
    let max_score = get_max_score(params)?;
    check_bonus(params, raw_score, max_score)?;

    require_exists(conn, "classes", &class_id, "class")?;
    require_exists(conn, "students", &student_id, "student")?;

    conn.execute(
        "INSERT INTO assessments(id, student_id, class_id, subject, assessment_type, raw_score, max_score, term, academic_year, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, class_id, subject, assessment_type, term, academic_year) DO UPDATE SET
           raw_score = excluded.raw_score,
           max_score = excluded.max_score,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &class_id,
            &subject,
            assessment_type.as_str(),
            raw_score,
            max_score,
            &term,
            &academic_year,
            now(),
        ),
    )
    .map_err(|e| HandlerErr::update("assessments", e))?;

    let assessment_id: String = conn
        .query_row(
            "SELECT id FROM assessments
             WHERE student_id = ? AND class_id = ? AND subject = ? AND assessment_type = ?
               AND term = ? AND academic_year = ?",
            (
                &student_id,
                &class_id,
                &subject,
                assessment_type.as_str(),
                &term,
                &academic_year,
            ),
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;

    Ok(json!({ "assessmentId": assessment_id }))
}

fn assessments_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT id, student_id, class_id, subject, assessment_type, raw_score, max_score, term, academic_year, updated_at
         FROM assessments WHERE 1 = 1",
    );
    let mut binds: Vec<SqlValue> = Vec::new();
    for (key, col) in [
        ("studentId", "student_id"),
        ("classId", "class_id"),
        ("subject", "subject"),
        ("term", "term"),
        ("academicYear", "academic_year"),
    ] {
        if let Some(v) = get_optional_str(params, key)? {
            sql.push_str(&format!(" AND {} = ?", col));
            binds.push(SqlValue::Text(v));
        }
    }
    if let Some(raw) = get_optional_str(params, "assessmentType")? {
        sql.push_str(" AND assessment_type = ?");
        binds.push(SqlValue::Text(parse_type(&raw)?.as_str().to_string()));
    }
    sql.push_str(" ORDER BY student_id, subject, academic_year, term, assessment_type");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let assessments = stmt
        .query_map(params_from_iter(binds), |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let class_id: String = r.get(2)?;
            let subject: String = r.get(3)?;
            let assessment_type: String = r.get(4)?;
            let raw_score: f64 = r.get(5)?;
            let max_score: f64 = r.get(6)?;
            let term: String = r.get(7)?;
            let academic_year: String = r.get(8)?;
            let updated_at: String = r.get(9)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "classId": class_id,
                "subject": subject,
                "assessmentType": assessment_type,
                "rawScore": raw_score,
                "maxScore": max_score,
                "term": term,
                "academicYear": academic_year,
                "updatedAt": updated_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "assessments": assessments }))
}

fn assessments_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assessment_id = get_required_str(params, "assessmentId")?;
    let n = conn
        .execute("DELETE FROM assessments WHERE id = ?", [&assessment_id])
        .map_err(|e| HandlerErr::update("assessments", e))?;
    if n == 0 {
        return Err(HandlerErr::new("not_found", "assessment not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = match req.method.as_str() {
        "assessments.record" => assessments_record,
        "assessments.list" => assessments_list,
        "assessments.delete" => assessments_delete,
        _ => return None,
    };
    let result = db_conn(state).and_then(|conn| run(conn, &req.params));
    Some(respond(req, result))
}
