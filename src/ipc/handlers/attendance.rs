use crate::calc::AttendanceStatus;
use crate::ipc::helpers::{
    db_conn, get_date, get_optional_date, get_optional_str, get_required_str, now, require_exists,
    respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::json;
use uuid::Uuid;

fn parse_status(raw: &str) -> Result<AttendanceStatus, HandlerErr> {
    AttendanceStatus::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params("status must be one of: present, absent, late"))
}

struct Mark<'a> {
    student_id: &'a str,
    class_id: &'a str,
    date: &'a str,
    status: AttendanceStatus,
    term: &'a str,
    academic_year: &'a str,
}

fn upsert_mark(conn: &Connection, m: &Mark<'_>) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO attendance(id, student_id, class_id, date, status, term, academic_year, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, class_id, date) DO UPDATE SET
           status = excluded.status,
           term = excluded.term,
           academic_year = excluded.academic_year,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            m.student_id,
            m.class_id,
            m.date,
            m.status.as_str(),
            m.term,
            m.academic_year,
            now(),
        ),
    )
}

fn attendance_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let class_id = get_required_str(params, "classId")?;
    let date = get_date(params, "date")?;
    let status = parse_status(&get_required_str(params, "status")?)?;
    let term = get_required_str(params, "term")?;
    let academic_year = get_required_str(params, "academicYear")?;
    require_exists(conn, "classes", &class_id, "class")?;
    require_exists(conn, "students", &student_id, "student")?;

    upsert_mark(
        conn,
        &Mark {
            student_id: &student_id,
            class_id: &class_id,
            date: &date,
            status,
            term: &term,
            academic_year: &academic_year,
        },
    )
    .map_err(|e| HandlerErr::update("attendance", e))?;

    Ok(json!({ "studentId": student_id, "date": date, "status": status }))
}

/// Marks a whole class for one day. Either every entry is written or none is.
fn attendance_mark_class(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = get_date(params, "date")?;
    let term = get_required_str(params, "term")?;
    let academic_year = get_required_str(params, "academicYear")?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    require_exists(conn, "classes", &class_id, "class")?;

    let mut parsed: Vec<(String, AttendanceStatus)> = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let student_id = get_required_str(entry, "studentId")
            .map_err(|e| HandlerErr::bad_params(format!("entries[{}]: {}", i, e.message)))?;
        let status = get_required_str(entry, "status")
            .and_then(|s| parse_status(&s))
            .map_err(|e| HandlerErr::bad_params(format!("entries[{}]: {}", i, e.message)))?;
        require_exists(conn, "students", &student_id, "student")?;
        parsed.push((student_id, status));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (student_id, status) in &parsed {
        upsert_mark(
            &tx,
            &Mark {
                student_id,
                class_id: &class_id,
                date: &date,
                status: *status,
                term: &term,
                academic_year: &academic_year,
            },
        )
        .map_err(|e| HandlerErr::update("attendance", e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    Ok(json!({ "classId": class_id, "date": date, "marked": parsed.len() }))
}

fn attendance_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT student_id, class_id, date, status, term, academic_year
         FROM attendance WHERE 1 = 1",
    );
    let mut binds: Vec<SqlValue> = Vec::new();
    for (key, col) in [
        ("studentId", "student_id"),
        ("classId", "class_id"),
        ("term", "term"),
        ("academicYear", "academic_year"),
    ] {
        if let Some(v) = get_optional_str(params, key)? {
            sql.push_str(&format!(" AND {} = ?", col));
            binds.push(SqlValue::Text(v));
        }
    }
    // ISO dates compare correctly as text.
    if let Some(from) = get_optional_date(params, "from")? {
        sql.push_str(" AND date >= ?");
        binds.push(SqlValue::Text(from));
    }
    if let Some(to) = get_optional_date(params, "to")? {
        sql.push_str(" AND date <= ?");
        binds.push(SqlValue::Text(to));
    }
    sql.push_str(" ORDER BY date, student_id");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let entries = stmt
        .query_map(params_from_iter(binds), |r| {
            let student_id: String = r.get(0)?;
            let class_id: String = r.get(1)?;
            let date: String = r.get(2)?;
            let status: String = r.get(3)?;
            let term: String = r.get(4)?;
            let academic_year: String = r.get(5)?;
            Ok(json!({
                "studentId": student_id,
                "classId": class_id,
                "date": date,
                "status": status,
                "term": term,
                "academicYear": academic_year
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = match req.method.as_str() {
        "attendance.mark" => attendance_mark,
        "attendance.markClass" => attendance_mark_class,
        "attendance.list" => attendance_list,
        _ => return None,
    };
    let result = db_conn(state).and_then(|conn| run(conn, &req.params));
    Some(respond(req, result))
}
