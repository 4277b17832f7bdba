mod test_support;

use serde_json::json;
use test_support::{create_exam, id_of, request_ok, seed_basics, spawn_sidecar, temp_dir};

fn marks_of(result: &serde_json::Value) -> Vec<(i64, i64)> {
    result
        .get("marks")
        .and_then(|v| v.as_array())
        .expect("marks")
        .iter()
        .map(|m| (id_of(m, "studentId"), id_of(m, "mark")))
        .collect()
}

#[test]
fn reimporting_the_same_row_is_idempotent() {
    let workspace = temp_dir("examd-import-idempotent");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_basics(&mut stdin, &mut reader, &["Ada"]);
    let exam_id = create_exam(&mut stdin, &mut reader, "2", "Algebra", seeded.subject_id, &[seeded.term_id]);

    let csv = format!("student_id,exam_id,mark\n{},{},70\n", seeded.students[0], exam_id);
    for id in ["3", "4"] {
        let res = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "results.importCsv",
            json!({ "csvText": csv, "fileName": "marks.csv" }),
        );
        assert_eq!(id_of(&res, "imported"), 1);
        assert_eq!(res["errors"].as_array().map(|a| a.len()), Some(0));
    }

    let list = request_ok(&mut stdin, &mut reader, "5", "results.list", json!({ "examId": exam_id }));
    let results = list["results"].as_array().expect("results");
    assert_eq!(results.len(), 1, "second import must merge, not duplicate");
    let result_id = id_of(&results[0], "id");
    assert_eq!(results[0]["title"], json!("Results – Algebra"));

    let got = request_ok(&mut stdin, &mut reader, "6", "results.get", json!({ "resultId": result_id }));
    assert_eq!(marks_of(&got), vec![(seeded.students[0], 70)]);

    let history = request_ok(&mut stdin, &mut reader, "7", "results.importHistory", json!({}));
    let runs = history["runs"].as_array().expect("runs");
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0]["sha256"], runs[1]["sha256"]);
    assert_eq!(runs[0]["fileName"], json!("marks.csv"));
}

#[test]
fn import_overwrites_existing_marks_and_appends_new_students() {
    let workspace = temp_dir("examd-import-merge");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_basics(&mut stdin, &mut reader, &["Ada", "Ben", "Cy"]);
    let (s1, s2, s3) = (seeded.students[0], seeded.students[1], seeded.students[2]);
    let exam_id = create_exam(&mut stdin, &mut reader, "2", "Algebra", seeded.subject_id, &[seeded.term_id]);

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.save",
        json!({
            "examId": exam_id,
            "marks": [
                { "studentId": s1, "mark": 60 },
                { "studentId": s2, "mark": 70 }
            ]
        }),
    );
    let result_id = id_of(&saved, "resultId");

    let csv = format!(
        "student_id,exam_id,mark\n{s2},{e},80\n{s3},{e},90\n",
        s2 = s2,
        s3 = s3,
        e = exam_id
    );
    let res = request_ok(&mut stdin, &mut reader, "4", "results.importCsv", json!({ "csvText": csv }));
    assert_eq!(id_of(&res, "imported"), 2);
    let touched = res["examsTouched"].as_array().expect("examsTouched");
    assert_eq!(touched.len(), 1);
    assert_eq!(id_of(&touched[0], "resultId"), result_id);
    assert_eq!(touched[0]["created"], json!(false));

    let got = request_ok(&mut stdin, &mut reader, "5", "results.get", json!({ "resultId": result_id }));
    assert_eq!(marks_of(&got), vec![(s1, 60), (s2, 80), (s3, 90)]);
}

#[test]
fn unresolved_rows_are_reported_and_the_rest_imported() {
    let workspace = temp_dir("examd-import-row-errors");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_basics(&mut stdin, &mut reader, &["Ada"]);
    let s1 = seeded.students[0];
    let exam_id = create_exam(&mut stdin, &mut reader, "2", "Algebra", seeded.subject_id, &[seeded.term_id]);

    let csv_path = workspace.join("incoming.csv");
    std::fs::write(
        &csv_path,
        format!(
            "student_id,exam_id,mark\n{s},{e},55\n999,{e},40\n{s},888,40\n{s}\n{s},{e},seventy\n",
            s = s1,
            e = exam_id
        ),
    )
    .expect("write csv");

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.importCsv",
        json!({ "inPath": csv_path.to_string_lossy() }),
    );
    assert_eq!(id_of(&res, "imported"), 1);
    assert_eq!(res["fileName"], json!("incoming.csv"));
    assert_eq!(
        res["errors"],
        json!([
            "Row 3: Student ID 999 not found",
            "Row 4: Exam ID 888 not found",
            "Row 5: Invalid format"
        ])
    );
    let warnings = res["warnings"].as_array().expect("warnings");
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].as_str().unwrap_or("").starts_with("Row 6:"));

    // Row 6 coerces to 0 and overwrites row 2 for the same student.
    let list = request_ok(&mut stdin, &mut reader, "4", "results.list", json!({ "examId": exam_id }));
    let result_id = id_of(&list["results"][0], "id");
    let got = request_ok(&mut stdin, &mut reader, "5", "results.get", json!({ "resultId": result_id }));
    assert_eq!(marks_of(&got), vec![(s1, 0)]);
}

#[test]
fn duplicate_rows_count_once_and_blank_lines_are_reported() {
    let workspace = temp_dir("examd-import-duplicates");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_basics(&mut stdin, &mut reader, &["Ada"]);
    let s1 = seeded.students[0];
    let exam_id = create_exam(&mut stdin, &mut reader, "2", "Algebra", seeded.subject_id, &[seeded.term_id]);

    let csv = format!(
        "student_id,exam_id,mark\n{s},{e},70\n\n{s},{e},80\n",
        s = s1,
        e = exam_id
    );
    let res = request_ok(&mut stdin, &mut reader, "3", "results.importCsv", json!({ "csvText": csv }));
    assert_eq!(id_of(&res, "imported"), 1);
    assert_eq!(res["errors"], json!(["Row 3: Invalid format"]));

    let history = request_ok(&mut stdin, &mut reader, "4", "results.importHistory", json!({}));
    assert_eq!(id_of(&history["runs"][0], "imported"), 1);
    assert_eq!(id_of(&history["runs"][0], "errorCount"), 1);

    let list = request_ok(&mut stdin, &mut reader, "5", "results.list", json!({ "examId": exam_id }));
    let result_id = id_of(&list["results"][0], "id");
    let got = request_ok(&mut stdin, &mut reader, "6", "results.get", json!({ "resultId": result_id }));
    assert_eq!(marks_of(&got), vec![(s1, 80)]);
}
