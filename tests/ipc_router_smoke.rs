mod test_support;

use serde_json::json;
use test_support::{error_code, request, roster_csv, spawn_sidecar, temp_dir, write_file};

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("idcard-router-smoke");
    let roster = write_file(&workspace.join("in").join("roster.csv"), &roster_csv(3));
    let queued = write_file(&workspace.join("in").join("queued.csv"), &roster_csv(2));
    let csv_out = workspace.join("out").join("cards.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let before = request(&mut stdin, &mut reader, "1", "students.list", json!({}));
    assert_eq!(error_code(&before), "no_workspace");

    let calls = vec![
        ("2", "health", json!({})),
        ("3", "workspace.select", json!({ "path": workspace.to_string_lossy() })),
        ("4", "setup.get", json!({})),
        (
            "5",
            "setup.update",
            json!({ "section": "export", "patch": { "cardColour": "blue" } }),
        ),
        (
            "6",
            "ingest.run",
            json!({ "inPath": roster.to_string_lossy(), "campus": "main" }),
        ),
        (
            "7",
            "jobs.enqueue",
            json!({ "inPath": queued.to_string_lossy(), "campus": "north" }),
        ),
        ("8", "jobs.runPending", json!({})),
        ("9", "jobs.list", json!({})),
        ("10", "students.list", json!({})),
        ("11", "students.stats", json!({})),
        (
            "12",
            "export.legacyCards",
            json!({ "outPath": csv_out.to_string_lossy() }),
        ),
    ];
    for (id, method, params) in calls {
        let resp = request(&mut stdin, &mut reader, id, method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            resp
        );
    }

    let unknown = request(&mut stdin, &mut reader, "13", "students.delete", json!({}));
    assert_eq!(error_code(&unknown), "not_implemented");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn malformed_request_lines_get_bad_json_and_the_loop_continues() {
    use std::io::{BufRead, Write};

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json reply");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("reply is json");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "bad_json");

    let health = request(&mut stdin, &mut reader, "after", "health", json!({}));
    assert_eq!(health["ok"], true);
    assert!(health["result"]["workspacePath"].is_null());

    drop(stdin);
    let _ = child.wait();
}
