use crate::audit::{self, AuditFilter};
use crate::calc::{NaturalKey, ScoringPolicy};
use crate::carry::{
    self, AdjustError, AdjustPatch, CarryField, CarryMarkFilter, RecomputeOutcome, WriteOptions,
};
use crate::ipc::helpers::{
    db_conn, db_conn_mut, get_optional_bool, get_optional_str, get_required_str, natural_key,
    require_exists, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::policy;
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

const DEFAULT_AUDIT_LIMIT: u64 = 100;
const MAX_AUDIT_LIMIT: u64 = 1000;

impl From<AdjustError> for HandlerErr {
    fn from(e: AdjustError) -> Self {
        match e {
            AdjustError::BadPatch(m) => HandlerErr::bad_params(m),
            AdjustError::Engine(e) => e.into(),
        }
    }
}

fn to_json<T: serde::Serialize>(v: &T) -> Result<Value, HandlerErr> {
    serde_json::to_value(v).map_err(|e| HandlerErr::new("serialize_failed", e.to_string()))
}

/// Stored workspace policy, with an optional per-request `policy` object
/// merged over it.
fn effective_policy(conn: &Connection, params: &Value) -> Result<ScoringPolicy, HandlerErr> {
    let stored = policy::load(conn)?;
    match params.get("policy") {
        None | Some(Value::Null) => Ok(stored),
        Some(Value::Object(patch)) => Ok(policy::apply_patch(&stored, patch)?),
        Some(_) => Err(HandlerErr::bad_params("policy must be an object")),
    }
}

fn write_options<'a>(params: &'a Value, policy: &ScoringPolicy) -> Result<WriteOptions<'a>, HandlerErr> {
    let actor = match params.get("actor") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.as_str()),
        Some(_) => return Err(HandlerErr::bad_params("actor must be a string")),
    };
    Ok(WriteOptions {
        actor,
        max_attempts: policy.max_upsert_attempts,
    })
}

fn list_filter(params: &Value) -> Result<CarryMarkFilter, HandlerErr> {
    Ok(CarryMarkFilter {
        subject: get_optional_str(params, "subject")?,
        term: get_optional_str(params, "term")?,
        academic_year: get_optional_str(params, "academicYear")?,
    })
}

fn parse_patch(fields: &Map<String, Value>) -> Result<AdjustPatch, HandlerErr> {
    let mut patch = AdjustPatch::default();
    for (k, v) in fields {
        let Some(field) = CarryField::parse(k) else {
            return Err(HandlerErr::bad_params(format!("unknown field: {}", k)));
        };
        if v.is_null() {
            return Err(HandlerErr::bad_params(format!(
                "{} must not be null; use carryMarks.releaseAdjustments to hand it back",
                k
            )));
        }
        if field == CarryField::Grade {
            let Some(g) = v.as_str() else {
                return Err(HandlerErr::bad_params("grade must be a string"));
            };
            patch.grade = Some(g.trim().to_string());
            continue;
        }
        let Some(n) = v.as_f64() else {
            return Err(HandlerErr::bad_params(format!("{} must be a number", k)));
        };
        match field {
            CarryField::AssessmentAverage => patch.assessment_average = Some(n),
            CarryField::AssignmentAverage => patch.assignment_average = Some(n),
            CarryField::AttendancePercentage => patch.attendance_percentage = Some(n),
            CarryField::FinalScore => patch.final_score = Some(n),
            CarryField::Grade => {}
        }
    }
    Ok(patch)
}

fn require_class_and_student(conn: &Connection, key: &NaturalKey) -> Result<(), HandlerErr> {
    require_exists(conn, "classes", &key.class_id, "class")?;
    require_exists(conn, "students", &key.student_id, "student")
}

fn carry_recompute(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let key = natural_key(params)?;
    let conn = db_conn_mut(state)?;
    require_class_and_student(conn, &key)?;
    let policy = effective_policy(conn, params)?;
    let opts = write_options(params, &policy)?;
    match carry::recompute(conn, &key, &policy, opts)? {
        RecomputeOutcome::Computed { record } => {
            Ok(json!({ "status": "computed", "record": to_json(&record)? }))
        }
        RecomputeOutcome::NoData => Ok(json!({ "status": "noData" })),
    }
}

fn carry_adjust(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let key = natural_key(params)?;
    let Some(fields) = params.get("fields").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("fields must be an object"));
    };
    let patch = parse_patch(fields)?;
    let create = get_optional_bool(params, "create", true)?;

    let conn = db_conn_mut(state)?;
    require_class_and_student(conn, &key)?;
    let policy = policy::load(conn)?;
    let opts = write_options(params, &policy)?;
    let record = carry::adjust(conn, &key, &patch, create, policy.weights, opts)?;
    Ok(json!({ "record": to_json(&record)? }))
}

fn carry_release(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let key = natural_key(params)?;
    let fields: Option<BTreeSet<CarryField>> = match params.get("fields") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => {
            let mut out = BTreeSet::new();
            for item in items {
                let field = item
                    .as_str()
                    .and_then(CarryField::parse)
                    .ok_or_else(|| HandlerErr::bad_params(format!("unknown field: {}", item)))?;
                out.insert(field);
            }
            Some(out)
        }
        Some(_) => return Err(HandlerErr::bad_params("fields must be an array")),
    };

    let conn = db_conn_mut(state)?;
    let policy = policy::load(conn)?;
    let opts = write_options(params, &policy)?;
    let record = carry::release_adjustments(conn, &key, fields.as_ref(), opts)?;
    Ok(json!({ "record": to_json(&record)? }))
}

fn carry_get(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let key = natural_key(params)?;
    let conn = db_conn(state)?;
    let record = carry::get(conn, &key)?;
    Ok(json!({ "record": to_json(&record)? }))
}

fn carry_list_by_student(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let filter = list_filter(params)?;
    let conn = db_conn(state)?;
    let records = carry::list_by_student(conn, &student_id, &filter)?;
    Ok(json!({ "records": to_json(&records)? }))
}

fn carry_list_by_class(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let filter = list_filter(params)?;
    let conn = db_conn(state)?;
    let records = carry::list_by_class(conn, &class_id, &filter)?;
    Ok(json!({ "records": to_json(&records)? }))
}

fn carry_recompute_class(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject = get_required_str(params, "subject")?;
    let term = get_required_str(params, "term")?;
    let academic_year = get_required_str(params, "academicYear")?;

    let conn = db_conn_mut(state)?;
    require_exists(conn, "classes", &class_id, "class")?;
    let policy = effective_policy(conn, params)?;
    let opts = write_options(params, &policy)?;
    let out = carry::recompute_class(
        conn,
        &class_id,
        &subject,
        &term,
        &academic_year,
        &policy,
        opts,
    )?;
    tracing::info!(
        class_id = %class_id,
        subject = %subject,
        computed = out.computed.len(),
        no_data = out.no_data.len(),
        "class carry marks recomputed"
    );
    to_json(&out)
}

fn audit_list(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let limit = match params.get("limit") {
        None | Some(Value::Null) => DEFAULT_AUDIT_LIMIT,
        Some(v) => v
            .as_u64()
            .filter(|n| (1..=MAX_AUDIT_LIMIT).contains(n))
            .ok_or_else(|| {
                HandlerErr::bad_params(format!("limit must be between 1 and {}", MAX_AUDIT_LIMIT))
            })?,
    };
    let filter = AuditFilter {
        student_id: get_optional_str(params, "studentId")?,
        class_id: get_optional_str(params, "classId")?,
        limit: limit as usize,
    };
    let conn = db_conn(state)?;
    let entries = audit::list(conn, &filter).map_err(HandlerErr::query)?;
    Ok(json!({ "entries": to_json(&entries)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = match req.method.as_str() {
        "carryMarks.recompute" => carry_recompute,
        "carryMarks.adjust" => carry_adjust,
        "carryMarks.releaseAdjustments" => carry_release,
        "carryMarks.get" => carry_get,
        "carryMarks.listByStudent" => carry_list_by_student,
        "carryMarks.listByClass" => carry_list_by_class,
        "carryMarks.recomputeClass" => carry_recompute_class,
        "audit.list" => audit_list,
        _ => return None,
    };
    Some(respond(req, run(state, &req.params)))
}
