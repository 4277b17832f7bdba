use crate::calc::{self, MarkSheet};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, id_value, optional_id, required_id, row_exists};
use crate::ipc::types::{AppState, Request};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub fn result_title(exam_title: &str) -> String {
    format!("Results – {}", exam_title)
}

pub(super) fn exam_title(conn: &Connection, exam_id: i64) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT title FROM exams WHERE id = ?", [exam_id], |r| {
        r.get(0)
    })
    .optional()
}

pub(super) fn load_sheet(conn: &Connection, result_id: i64) -> rusqlite::Result<MarkSheet> {
    let mut stmt = conn.prepare(
        "SELECT student_id, mark FROM result_marks WHERE result_id = ? ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([result_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<(i64, i64)>, _>>()?;
    Ok(rows)
}

/// Upserts `marks` onto a result; existing rows keep their position.
fn upsert_marks(conn: &Connection, result_id: i64, marks: &[(i64, i64)]) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO result_marks(result_id, student_id, mark)
         VALUES(?, ?, ?)
         ON CONFLICT(result_id, student_id) DO UPDATE SET
           mark = excluded.mark",
    )?;
    for &(student_id, mark) in marks {
        stmt.execute((result_id, student_id, calc::clamp_mark(mark)))?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub result_id: i64,
    pub created: bool,
    pub merged: MarkSheet,
}

/// Merges `incoming` into the exam's Result (the lowest id when several exist),
/// creating one when the exam has none. Runs in its own transaction.
pub fn merge_into_exam(
    conn: &Connection,
    exam_id: i64,
    incoming: &[(i64, i64)],
) -> anyhow::Result<MergeOutcome> {
    let tx = conn
        .unchecked_transaction()
        .context("failed to begin transaction")?;

    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM results WHERE exam_id = ? ORDER BY id LIMIT 1",
            [exam_id],
            |r| r.get(0),
        )
        .optional()?;

    let outcome = match existing {
        Some(result_id) => {
            let old = load_sheet(&tx, result_id)?;
            let merged = calc::merge_marks(&old, incoming);
            upsert_marks(&tx, result_id, incoming)?;
            tx.execute(
                "UPDATE results SET updated_at = ? WHERE id = ?",
                (db::now_timestamp(), result_id),
            )?;
            MergeOutcome {
                result_id,
                created: false,
                merged,
            }
        }
        None => {
            let title = exam_title(&tx, exam_id)?
                .map(|t| result_title(&t))
                .unwrap_or_else(|| result_title(&format!("Exam #{}", exam_id)));
            tx.execute(
                "INSERT INTO results(exam_id, title, updated_at) VALUES(?, ?, ?)",
                (exam_id, &title, db::now_timestamp()),
            )?;
            let result_id = tx.last_insert_rowid();
            let merged = calc::merge_marks(&[], incoming);
            upsert_marks(&tx, result_id, &merged)?;
            MergeOutcome {
                result_id,
                created: true,
                merged,
            }
        }
    };

    tx.commit().context("failed to commit merge")?;
    Ok(outcome)
}

struct ParsedManualMarks {
    marks: MarkSheet,
    warnings: Vec<String>,
}

/// Accepts `{ "<studentId>": value }` (applied in student id order) or
/// `[{ "studentId", "mark" }]` (applied in array order). Blank values are skipped.
fn parse_manual_marks(
    req: &Request,
    raw: &serde_json::Value,
) -> Result<ParsedManualMarks, serde_json::Value> {
    let mut pairs: Vec<(i64, Option<&serde_json::Value>)> = Vec::new();
    match raw {
        serde_json::Value::Object(obj) => {
            for (k, v) in obj {
                let Ok(sid) = k.trim().parse::<i64>() else {
                    return Err(err(
                        &req.id,
                        "bad_params",
                        "marks keys must be student ids",
                        Some(json!({ "key": k })),
                    ));
                };
                pairs.push((sid, Some(v)));
            }
            pairs.sort_by_key(|(sid, _)| *sid);
        }
        serde_json::Value::Array(items) => {
            for item in items {
                let sid = item.get("studentId").and_then(id_value);
                let Some(sid) = sid else {
                    return Err(err(
                        &req.id,
                        "bad_params",
                        "marks entries need an integer studentId",
                        Some(json!({ "entry": item })),
                    ));
                };
                pairs.push((sid, item.get("mark")));
            }
        }
        _ => {
            return Err(err(
                &req.id,
                "bad_params",
                "marks must be an object or an array",
                None,
            ))
        }
    }

    let mut out = ParsedManualMarks {
        marks: Vec::new(),
        warnings: Vec::new(),
    };
    let mut incoming: MarkSheet = Vec::with_capacity(pairs.len());
    for (sid, v) in pairs {
        let mark = match v {
            None | Some(serde_json::Value::Null) => continue,
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => continue,
            Some(serde_json::Value::String(s)) => {
                let (mark, coerced) = calc::parse_mark_lenient(s);
                if coerced {
                    out.warnings.push(format!(
                        "Student {}: mark \"{}\" is not a number, stored as {}",
                        sid, s, mark
                    ));
                }
                mark
            }
            Some(serde_json::Value::Number(n)) => match n.as_i64() {
                Some(i) => calc::clamp_mark(i),
                None => calc::mark_from_f64(n.as_f64().unwrap_or(0.0)),
            },
            Some(other) => {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "mark must be a number or numeric string",
                    Some(json!({ "studentId": sid, "mark": other })),
                ))
            }
        };
        incoming.push((sid, mark));
    }
    out.marks = calc::merge_marks(&[], &incoming);
    Ok(out)
}

fn handle_results_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    // No exam selected or nothing submitted: nothing is written.
    let exam_raw = req.params.get("examId").filter(|v| match v {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.trim().is_empty(),
        _ => true,
    });
    let marks_raw = req.params.get("marks").filter(|v| match v {
        serde_json::Value::Object(o) => !o.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        _ => false,
    });
    let (Some(_), Some(marks_raw)) = (exam_raw, marks_raw) else {
        log::debug!("results.save without exam or marks; skipping");
        return ok(&req.id, json!({ "saved": false }));
    };

    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let result_id = match optional_id(req, "resultId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let parsed = match parse_manual_marks(req, marks_raw) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let title = match exam_title(conn, exam_id) {
        Ok(Some(t)) => t,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "exam not found",
                Some(json!({ "examId": exam_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut unknown: Vec<i64> = Vec::new();
    for &(sid, _) in &parsed.marks {
        match row_exists(conn, "students", sid) {
            Ok(true) => {}
            Ok(false) => unknown.push(sid),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    if !unknown.is_empty() {
        return err(
            &req.id,
            "not_found",
            "unknown student ids in marks",
            Some(json!({ "studentIds": unknown })),
        );
    }
    if let Some(rid) = result_id {
        match row_exists(conn, "results", rid) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "result not found",
                    Some(json!({ "resultId": rid })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let saved_id = match result_id {
        Some(rid) => {
            if let Err(e) = tx.execute(
                "UPDATE results SET exam_id = ?, updated_at = ? WHERE id = ?",
                (exam_id, db::now_timestamp(), rid),
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            // Manual entry replaces the mapping wholesale.
            if let Err(e) = tx.execute("DELETE FROM result_marks WHERE result_id = ?", [rid]) {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_delete_failed",
                    e.to_string(),
                    Some(json!({ "table": "result_marks" })),
                );
            }
            rid
        }
        None => {
            if let Err(e) = tx.execute(
                "INSERT INTO results(exam_id, title, updated_at) VALUES(?, ?, ?)",
                (exam_id, result_title(&title), db::now_timestamp()),
            ) {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "results" })),
                );
            }
            tx.last_insert_rowid()
        }
    };

    if let Err(e) = upsert_marks(&tx, saved_id, &parsed.marks) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "result_marks" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    for w in &parsed.warnings {
        log::warn!("result {}: {}", saved_id, w);
    }

    ok(
        &req.id,
        json!({
            "saved": true,
            "resultId": saved_id,
            "examId": exam_id,
            "markCount": parsed.marks.len(),
            "warnings": parsed.warnings
        }),
    )
}

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "results": [] }));
    };
    let exam_filter = match optional_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT
           r.id,
           r.exam_id,
           e.title,
           r.title,
           r.updated_at,
           (SELECT COUNT(*) FROM result_marks m WHERE m.result_id = r.id) AS mark_count
         FROM results r
         JOIN exams e ON e.id = r.exam_id
         WHERE (?1 IS NULL OR r.exam_id = ?1)
         ORDER BY r.id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([exam_filter], |row| {
            let id: i64 = row.get(0)?;
            let exam_id: i64 = row.get(1)?;
            let exam_title: String = row.get(2)?;
            let title: String = row.get(3)?;
            let updated_at: Option<String> = row.get(4)?;
            let mark_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "examId": exam_id,
                "examTitle": exam_title,
                "title": title,
                "updatedAt": updated_at,
                "markCount": mark_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(results) => ok(&req.id, json!({ "results": results })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_results_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let result_id = match required_id(req, "resultId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let head: Option<(i64, String)> = match conn
        .query_row(
            "SELECT exam_id, title FROM results WHERE id = ?",
            [result_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((exam_id, title)) = head else {
        return err(&req.id, "not_found", "result not found", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT m.student_id, s.display_name, m.mark
         FROM result_marks m
         JOIN students s ON s.id = m.student_id
         WHERE m.result_id = ?
         ORDER BY m.rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let marks = stmt
        .query_map([result_id], |r| {
            let student_id: i64 = r.get(0)?;
            let name: String = r.get(1)?;
            let mark: i64 = r.get(2)?;
            Ok(json!({
                "studentId": student_id,
                "studentName": name,
                "mark": mark
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match marks {
        Ok(marks) => ok(
            &req.id,
            json!({
                "id": result_id,
                "examId": exam_id,
                "title": title,
                "marks": marks
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_results_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let result_id = match required_id(req, "resultId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match row_exists(conn, "results", result_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "result not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM result_marks WHERE result_id = ?", [result_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "result_marks" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM results WHERE id = ?", [result_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "results" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.list" => Some(handle_results_list(state, req)),
        "results.get" => Some(handle_results_get(state, req)),
        "results.save" => Some(handle_results_save(state, req)),
        "results.delete" => Some(handle_results_delete(state, req)),
        _ => None,
    }
}
