use crate::ipc::helpers::{db_conn, get_optional_str, get_required_str, now, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn classes_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // Correlated subquery so the count is not inflated by joins.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.form,
               c.subject,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.active = 1) AS student_count
             FROM classes c
             ORDER BY c.name, c.id",
        )
        .map_err(HandlerErr::query)?;

    let classes = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let form: Option<String> = row.get(2)?;
            let subject: Option<String> = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "form": form,
                "subject": subject,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "classes": classes }))
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let form = get_optional_str(params, "form")?;
    let subject = get_optional_str(params, "subject")?;

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name, form, subject, created_at) VALUES(?, ?, ?, ?, ?)",
        (&class_id, &name, &form, &subject, now()),
    )
    .map_err(|e| HandlerErr::update("classes", e))?;

    Ok(json!({ "classId": class_id, "name": name }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    // Listing before a workspace is open is not an error for the UI.
    let Some(conn) = state.db.as_ref() else {
        return respond(req, Ok(json!({ "classes": [] })));
    };
    respond(req, classes_list(conn))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| classes_create(conn, &req.params));
    respond(req, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        _ => None,
    }
}
