use crate::csv_import::{self, CsvMarkRow, RowIssue};
use crate::db;
use crate::ipc::error::{err, err_chain, ok};
use crate::ipc::handlers::results;
use crate::ipc::helpers::{db_conn, row_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;

/// Caches existence lookups so a file naming the same ids repeatedly stays cheap.
struct IdResolver<'a> {
    conn: &'a Connection,
    students: HashMap<i64, bool>,
    exams: HashMap<i64, bool>,
}

impl<'a> IdResolver<'a> {
    fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            students: HashMap::new(),
            exams: HashMap::new(),
        }
    }

    fn student(&mut self, id: i64) -> rusqlite::Result<bool> {
        if let Some(v) = self.students.get(&id) {
            return Ok(*v);
        }
        let found = id > 0 && row_exists(self.conn, "students", id)?;
        self.students.insert(id, found);
        Ok(found)
    }

    fn exam(&mut self, id: i64) -> rusqlite::Result<bool> {
        if let Some(v) = self.exams.get(&id) {
            return Ok(*v);
        }
        let found = id > 0 && row_exists(self.conn, "exams", id)?;
        self.exams.insert(id, found);
        Ok(found)
    }
}

fn read_source(req: &Request) -> Result<(Vec<u8>, Option<String>), serde_json::Value> {
    let file_name = req
        .params
        .get("fileName")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(text) = req.params.get("csvText").and_then(|v| v.as_str()) {
        return Ok((text.as_bytes().to_vec(), file_name));
    }
    let Some(in_path) = req.params.get("inPath").and_then(|v| v.as_str()) else {
        return Err(err(&req.id, "bad_params", "missing inPath or csvText", None));
    };
    let path = PathBuf::from(in_path);
    let bytes = csv_import::read_input_file(&path).map_err(|e| {
        err_chain(
            &req.id,
            "io_failed",
            &e,
            Some(json!({ "path": in_path })),
        )
    })?;
    let file_name = file_name.or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
    });
    Ok((bytes, file_name))
}

fn handle_results_import_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (bytes, file_name) = match read_source(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sha256 = csv_import::sha256_hex(&bytes);

    let parsed = match csv_import::parse_marks_csv(bytes.as_slice()) {
        Ok(v) => v,
        Err(e) => return err_chain(&req.id, "csv_parse_failed", &e, None),
    };

    let mut errors: Vec<RowIssue> = parsed.errors;
    let mut accepted: Vec<CsvMarkRow> = Vec::with_capacity(parsed.rows.len());
    let mut resolver = IdResolver::new(conn);
    for row in parsed.rows {
        match resolver.student(row.student_id) {
            Ok(true) => {}
            Ok(false) => {
                errors.push(RowIssue::new(
                    row.row,
                    format!("Student ID {} not found", row.student_id),
                ));
                continue;
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        match resolver.exam(row.exam_id) {
            Ok(true) => {}
            Ok(false) => {
                errors.push(RowIssue::new(
                    row.row,
                    format!("Exam ID {} not found", row.exam_id),
                ));
                continue;
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        accepted.push(row);
    }

    let mut imported: usize = 0;
    let mut touched: Vec<serde_json::Value> = Vec::new();
    for (exam_id, sheet) in csv_import::group_by_exam(&accepted) {
        let rows_for_exam: Vec<u64> = accepted
            .iter()
            .filter(|r| r.exam_id == exam_id)
            .map(|r| r.row)
            .collect();
        match results::merge_into_exam(conn, exam_id, &sheet) {
            Ok(outcome) => {
                // Distinct students per exam, not CSV rows.
                imported += sheet.len();
                touched.push(json!({
                    "examId": exam_id,
                    "resultId": outcome.result_id,
                    "created": outcome.created,
                    "markCount": outcome.merged.len()
                }));
            }
            Err(e) => {
                log::error!("import: exam {} not saved: {:#}", exam_id, e);
                for row in rows_for_exam {
                    errors.push(RowIssue::new(
                        row,
                        format!("Could not save marks for exam {}", exam_id),
                    ));
                }
            }
        }
    }

    errors.sort_by_key(|e| e.row);
    for e in &errors {
        log::warn!("import: {}", e.render());
    }

    let import_id = uuid::Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO import_runs(id, file_name, sha256, imported_count, error_count, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &import_id,
            &file_name,
            &sha256,
            imported as i64,
            errors.len() as i64,
            db::now_timestamp(),
        ),
    ) {
        // Marks are already committed; a missing history row is not fatal.
        log::warn!("import: failed to record run {}: {}", import_id, e);
    }

    log::info!(
        "import {}: {} marks imported, {} rows rejected, {} exams touched",
        import_id,
        imported,
        errors.len(),
        touched.len()
    );

    ok(
        &req.id,
        json!({
            "importId": import_id,
            "fileName": file_name,
            "sha256": sha256,
            "imported": imported,
            "examsTouched": touched,
            "errors": errors.iter().map(|e| e.render()).collect::<Vec<_>>(),
            "warnings": parsed.warnings.iter().map(|w| w.render()).collect::<Vec<_>>()
        }),
    )
}

fn handle_results_import_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "runs": [] }));
    };
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(20)
        .clamp(1, 200);

    let mut stmt = match conn.prepare(
        "SELECT id, file_name, sha256, imported_count, error_count, created_at
         FROM import_runs
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([limit], |r| {
            let id: String = r.get(0)?;
            let file_name: Option<String> = r.get(1)?;
            let sha256: String = r.get(2)?;
            let imported: i64 = r.get(3)?;
            let errors: i64 = r.get(4)?;
            let created_at: String = r.get(5)?;
            Ok(json!({
                "importId": id,
                "fileName": file_name,
                "sha256": sha256,
                "imported": imported,
                "errorCount": errors,
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(runs) => ok(&req.id, json!({ "runs": runs })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.importCsv" => Some(handle_results_import_csv(state, req)),
        "results.importHistory" => Some(handle_results_import_history(state, req)),
        _ => None,
    }
}
