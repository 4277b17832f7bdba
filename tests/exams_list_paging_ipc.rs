mod test_support;

use serde_json::json;
use test_support::{id_of, request_err, request_ok, seed_basics, spawn_sidecar, temp_dir};

const NOW: &str = "2024-06-01T12:00:00";

fn window(i: usize) -> (&'static str, &'static str, &'static str) {
    match i % 3 {
        0 => ("2024-05-01T09:00:00", "2024-05-01T11:00:00", "past"),
        1 => ("2024-06-01T09:00:00", "2024-06-01T15:00:00", "current"),
        _ => ("2024-07-01T09:00:00", "2024-07-01T11:00:00", "upcoming"),
    }
}

#[test]
fn second_page_is_taken_in_id_order_then_sorted_by_status() {
    let workspace = temp_dir("examd-exams-paging");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_basics(&mut stdin, &mut reader, &[]);

    let mut created: Vec<(i64, &'static str)> = Vec::new();
    for i in 1..=25 {
        let (start, end, status) = window(i);
        let res = request_ok(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            "exams.create",
            json!({
                "title": format!("Exam {}", i),
                "start": start,
                "end": end,
                "subjectId": seeded.subject_id
            }),
        );
        created.push((id_of(&res, "examId"), status));
    }

    let page2 = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "exams.list",
        json!({ "page": 2, "now": NOW }),
    );
    assert_eq!(id_of(&page2, "total"), 25);
    assert_eq!(id_of(&page2, "pageSize"), 10);
    assert_eq!(id_of(&page2, "page"), 2);

    let items = page2["exams"].as_array().expect("exams");
    assert_eq!(items.len(), 10);

    // Exams 11..=20 in creation order, regrouped current, upcoming, past.
    let window_ids = &created[10..20];
    let mut expected: Vec<i64> = Vec::new();
    for wanted in ["current", "upcoming", "past"] {
        expected.extend(
            window_ids
                .iter()
                .filter(|(_, s)| *s == wanted)
                .map(|(id, _)| *id),
        );
    }
    let got: Vec<i64> = items.iter().map(|e| id_of(e, "id")).collect();
    assert_eq!(got, expected);
    for item in items {
        let id = id_of(item, "id");
        let status = created
            .iter()
            .find(|(cid, _)| *cid == id)
            .map(|(_, s)| *s)
            .expect("known exam");
        assert_eq!(item["status"], json!(status));
    }

    let page3 = request_ok(&mut stdin, &mut reader, "3", "exams.list", json!({ "page": 3, "now": NOW }));
    assert_eq!(page3["exams"].as_array().map(|a| a.len()), Some(5));

    let page0 = request_ok(&mut stdin, &mut reader, "4", "exams.list", json!({ "page": 0, "now": NOW }));
    let page1 = request_ok(&mut stdin, &mut reader, "5", "exams.list", json!({ "now": NOW }));
    assert_eq!(page0["exams"], page1["exams"]);
    assert_eq!(id_of(&page0, "page"), 1);

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "setup.update",
        json!({ "section": "exams", "patch": { "pageSize": 20 } }),
    );
    let wide = request_ok(&mut stdin, &mut reader, "7", "exams.list", json!({ "page": 2, "now": NOW }));
    assert_eq!(wide["exams"].as_array().map(|a| a.len()), Some(5));

    assert_eq!(
        request_err(&mut stdin, &mut reader, "8", "exams.list", json!({ "now": "soon" })),
        "bad_params"
    );
}

#[test]
fn exam_window_and_terms_are_validated() {
    let workspace = temp_dir("examd-exams-validate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_basics(&mut stdin, &mut reader, &[]);

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "2",
            "exams.create",
            json!({
                "title": "Backwards",
                "start": "2024-06-01T12:00",
                "end": "2024-06-01T09:00",
                "subjectId": seeded.subject_id
            }),
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "3",
            "exams.create",
            json!({
                "title": "No term",
                "start": "2024-06-01T09:00",
                "end": "2024-06-01T12:00",
                "subjectId": seeded.subject_id,
                "termIds": [seeded.term_id, 777]
            }),
        ),
        "not_found"
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "exams.create",
        json!({
            "title": "Physics",
            "start": "2024-06-01 09:00",
            "end": "2024-06-01 12:00",
            "subjectId": seeded.subject_id,
            "termIds": [seeded.term_id]
        }),
    );
    let exam_id = id_of(&created, "examId");
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "exams.get",
        json!({ "examId": exam_id, "now": "2024-06-01T10:30" }),
    );
    assert_eq!(got["start"], json!("2024-06-01T09:00:00"));
    assert_eq!(got["status"], json!("current"));
    assert_eq!(got["subjectName"], json!("Mathematics"));
    assert_eq!(got["termIds"], json!([seeded.term_id]));

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "exams.update",
        json!({ "examId": exam_id, "title": "Physics II", "termIds": [] }),
    );
    let got = request_ok(&mut stdin, &mut reader, "7", "exams.get", json!({ "examId": exam_id }));
    assert_eq!(got["title"], json!("Physics II"));
    assert_eq!(got["termIds"], json!([]));
}
