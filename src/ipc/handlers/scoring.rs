use crate::calc::ScoringPolicy;
use crate::ipc::helpers::{db_conn, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::policy;
use rusqlite::Connection;
use serde_json::json;

fn scoring_get(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let current = policy::load(conn)?;
    Ok(json!({ "policy": current }))
}

/// Patches the stored policy. The merged result must validate as a whole
/// before anything is persisted. A corrupt stored policy is patched over the
/// defaults so the workspace can be repaired.
fn scoring_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let current = match policy::load(conn) {
        Ok(p) => p,
        Err(e) if e.is_corrupt_policy() => {
            tracing::warn!(error = %e, "replacing corrupt stored scoring policy");
            ScoringPolicy::default()
        }
        Err(e) => return Err(e.into()),
    };
    let next = policy::apply_patch(&current, patch)?;
    policy::save(conn, &next).map_err(|e| HandlerErr::update("settings", e))?;
    tracing::info!(
        weights = ?next.weights,
        missing_components = ?next.missing_components,
        "scoring policy updated"
    );
    Ok(json!({ "policy": next }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = match req.method.as_str() {
        "scoring.get" => scoring_get,
        "scoring.update" => scoring_update,
        _ => return None,
    };
    let result = db_conn(state).and_then(|conn| run(conn, &req.params));
    Some(respond(req, result))
}
