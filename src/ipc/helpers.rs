use crate::calc::NaturalKey;
use crate::error::EngineError;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::policy::PolicyError;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn query(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn update(table: &str, e: impl std::fmt::Display) -> Self {
        Self {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<EngineError> for HandlerErr {
    fn from(e: EngineError) -> Self {
        tracing::error!(code = e.code(), error = %e, "scoring engine call failed");
        Self {
            code: e.code(),
            details: e.details(),
            message: e.to_string(),
        }
    }
}

impl From<PolicyError> for HandlerErr {
    fn from(e: PolicyError) -> Self {
        HandlerErr::new(e.code(), e.to_string())
    }
}

pub fn respond(req: &Request, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn db_conn_mut(state: &mut AppState) -> Result<&mut Connection, HandlerErr> {
    state
        .db
        .as_mut()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_optional_bool(params: &Value, key: &str, default: bool) -> Result<bool, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

/// Finite, non-negative score. `None` when the key is absent or null.
pub fn get_optional_score(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_f64()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key)))?;
            if !n.is_finite() || n < 0.0 {
                return Err(HandlerErr::bad_params(format!(
                    "{} must be a finite, non-negative number",
                    key
                )));
            }
            Ok(Some(n))
        }
    }
}

pub fn get_max_score(params: &Value) -> Result<f64, HandlerErr> {
    let max = get_optional_score(params, "maxScore")?.unwrap_or(100.0);
    if max <= 0.0 {
        return Err(HandlerErr::bad_params("maxScore must be > 0"));
    }
    Ok(max)
}

/// `rawScore > maxScore` is only accepted when the caller opts into bonus marks.
pub fn check_bonus(params: &Value, raw: f64, max: f64) -> Result<(), HandlerErr> {
    if raw > max && !get_optional_bool(params, "allowBonus", false)? {
        return Err(HandlerErr::bad_params(
            "rawScore exceeds maxScore; set allowBonus to record bonus marks",
        ));
    }
    Ok(())
}

pub fn get_date(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    parse_date(key, &raw)
}

pub fn get_optional_date(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match get_optional_str(params, key)? {
        Some(raw) => parse_date(key, &raw).map(Some),
        None => Ok(None),
    }
}

fn parse_date(key: &str, raw: &str) -> Result<String, HandlerErr> {
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| HandlerErr::bad_params(format!("{} must be a YYYY-MM-DD date", key)))
}

pub fn natural_key(params: &Value) -> Result<NaturalKey, HandlerErr> {
    Ok(NaturalKey {
        student_id: get_required_str(params, "studentId")?,
        class_id: get_required_str(params, "classId")?,
        subject: get_required_str(params, "subject")?,
        term: get_required_str(params, "term")?,
        academic_year: get_required_str(params, "academicYear")?,
    })
}

pub fn exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        &format!("SELECT 1 FROM {} WHERE id = ?", table),
        [id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

pub fn require_exists(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    if exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::new("not_found", format!("{} not found", what)))
    }
}

pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}
