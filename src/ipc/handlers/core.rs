use crate::db;
use crate::ipc::helpers::{get_required_str, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(
        req,
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        })),
    )
}

fn workspace_select(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let path = PathBuf::from(get_required_str(&req.params, "path")?);
    let conn = db::open_db(&path, state.config.busy_timeout).map_err(|e| {
        tracing::error!(path = %path.display(), error = ?e, "failed to open workspace");
        HandlerErr::new("db_open_failed", format!("{e:?}"))
    })?;
    tracing::info!(path = %path.display(), "workspace selected");
    // Replacing the connection closes the previous workspace.
    state.db = Some(conn);
    state.workspace = Some(path.clone());
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(respond(req, workspace_select(state, req))),
        _ => None,
    }
}
