mod test_support;

use serde_json::json;
use std::io::{BufRead, Write};
use test_support::{
    create_exam, id_of, request, request_err, request_ok, seed_basics, spawn_sidecar, temp_dir,
};

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("examd-router-smoke");
    let bundle_out = workspace.join("smoke-backup.zip");
    let report_out = workspace.join("smoke-stats.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").is_some());
    assert_eq!(
        request_err(&mut stdin, &mut reader, "2", "students.create", json!({ "displayName": "A" })),
        "no_workspace"
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let seeded = seed_basics(&mut stdin, &mut reader, &["Ada", "Ben"]);
    let exam_id = create_exam(
        &mut stdin,
        &mut reader,
        "4",
        "Algebra",
        seeded.subject_id,
        &[seeded.term_id],
    );

    let calls: Vec<(&str, serde_json::Value)> = vec![
        ("students.list", json!({})),
        ("subjects.list", json!({})),
        ("terms.list", json!({})),
        ("exams.list", json!({})),
        ("exams.get", json!({ "examId": exam_id })),
        (
            "results.save",
            json!({
                "examId": exam_id,
                "marks": [{ "studentId": seeded.students[0], "mark": 70 }]
            }),
        ),
        ("results.list", json!({ "examId": exam_id })),
        ("results.importHistory", json!({})),
        ("leaderboard.terms", json!({})),
        (
            "reports.studentTermTotal",
            json!({ "studentId": seeded.students[0], "termId": seeded.term_id }),
        ),
        ("reports.statisticsModel", json!({})),
        (
            "reports.statisticsExport",
            json!({ "outPath": report_out.to_string_lossy(), "format": "csv" }),
        ),
        ("setup.get", json!({})),
        (
            "backup.exportWorkspaceBundle",
            json!({ "outPath": bundle_out.to_string_lossy() }),
        ),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        request_ok(&mut stdin, &mut reader, &format!("c{}", i), method, params);
    }

    let total = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.studentTermTotal",
        json!({ "studentId": seeded.students[0], "termId": seeded.term_id }),
    );
    assert_eq!(id_of(&total, "total"), 70);

    let unknown = request(&mut stdin, &mut reader, "6", "nope.method", json!({}));
    assert_eq!(
        unknown.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    writeln!(stdin, "{{not json").expect("write bad line");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json response");
    let bad: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(
        bad.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_json")
    );

    // Still serving after a bad line.
    request_ok(&mut stdin, &mut reader, "7", "health", json!({}));

    assert!(bundle_out.is_file());
    assert!(report_out.is_file());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
