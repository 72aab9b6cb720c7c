mod audit;
mod calc;
mod carry;
mod config;
mod db;
mod error;
mod ipc;
mod policy;
mod store;
mod telemetry;

use std::io::{self, BufRead, Write};

fn main() -> anyhow::Result<()> {
    let config = config::DaemonConfig::load()?;
    telemetry::init(&config)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        busy_timeout_ms = config.busy_timeout.as_millis() as u64,
        "carrymarkd starting"
    );

    let mut state = ipc::AppState::new(config);
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed; shutting down");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => {
                tracing::debug!(id = %req.id, method = %req.method, "request");
                ipc::handle_request(&mut state, req)
            }
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request line");
                ipc::bad_json(e.to_string())
            }
        };
        // Value's Display is compact JSON on a single line.
        writeln!(stdout, "{}", resp)?;
        stdout.flush()?;
    }

    tracing::info!("stdin closed; exiting");
    Ok(())
}
