mod test_support;

use serde_json::json;
use test_support::{
    key_params, request, request_err, request_ok, send_line, spawn_sidecar, temp_dir,
};

#[test]
fn health_reports_version_and_workspace() {
    let workspace = temp_dir("carrymark-health");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let before = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(before["version"], env!("CARGO_PKG_VERSION"));
    assert!(before["workspacePath"].is_null());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let after = request_ok(&mut stdin, &mut reader, "3", "health", json!({}));
    assert_eq!(after["workspacePath"], json!(workspace.to_string_lossy()));
    assert!(workspace.join("carrymark.sqlite3").exists());
}

#[test]
fn malformed_lines_and_unknown_methods_get_error_responses() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let bad = send_line(&mut stdin, &mut reader, "{not json");
    assert_eq!(bad["ok"], false);
    assert_eq!(bad["error"]["code"], "bad_json");

    // The daemon keeps serving after a bad line.
    let unknown = request(&mut stdin, &mut reader, "2", "grades.teleport", json!({}));
    assert_eq!(unknown["ok"], false);
    assert_eq!(unknown["error"]["code"], "not_implemented");

    let code = request_err(&mut stdin, &mut reader, "3", "workspace.select", json!({}));
    assert_eq!(code, "bad_params");
}

#[test]
fn data_methods_require_a_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    for (id, method, params) in [
        ("1", "carryMarks.recompute", key_params("c1", "s1")),
        ("2", "carryMarks.get", key_params("c1", "s1")),
        ("3", "scoring.get", json!({})),
        ("4", "students.list", json!({ "classId": "c1" })),
        ("5", "audit.list", json!({})),
    ] {
        let code = request_err(&mut stdin, &mut reader, id, method, params);
        assert_eq!(code, "no_workspace", "{}", method);
    }

    // Listing classes is allowed and simply empty.
    let classes = request_ok(&mut stdin, &mut reader, "6", "classes.list", json!({}));
    assert_eq!(classes["classes"], json!([]));
}
