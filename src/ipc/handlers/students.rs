use crate::ipc::helpers::{
    db_conn, get_optional_str, get_required_str, now, require_exists, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?;
    let student_no = get_optional_str(params, "studentNo")?;
    require_exists(conn, "classes", &class_id, "class")?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, name, student_no, active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (&student_id, &class_id, &name, &student_no, now()),
    )
    .map_err(|e| HandlerErr::update("students", e))?;

    Ok(json!({ "studentId": student_id, "classId": class_id, "name": name }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, student_no, active
             FROM students
             WHERE class_id = ?
             ORDER BY name, id",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let student_no: Option<String> = r.get(2)?;
            let active: i64 = r.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "studentNo": student_no,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = match req.method.as_str() {
        "students.create" => students_create,
        "students.list" => students_list,
        _ => return None,
    };
    let result = db_conn(state).and_then(|conn| run(conn, &req.params));
    Some(respond(req, result))
}
