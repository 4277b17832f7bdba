use crate::calc::{self, ExamStatus};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, ensure_exists, id_value, required_id, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use super::setup;

struct ExamRow {
    id: i64,
    title: String,
    start: String,
    end: String,
    subject_id: i64,
}

fn exam_status(now: NaiveDateTime, start: &str, end: &str) -> ExamStatus {
    match (calc::parse_datetime(start), calc::parse_datetime(end)) {
        (Some(s), Some(e)) => calc::classify_exam(now, s, e),
        _ => {
            log::warn!("exam window {}..{} is not a valid datetime range", start, end);
            ExamStatus::Past
        }
    }
}

fn parse_now(req: &Request) -> Result<NaiveDateTime, serde_json::Value> {
    match req.params.get("now").and_then(|v| v.as_str()) {
        Some(raw) => calc::parse_datetime(raw).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                "now must be a datetime like 2024-06-01T12:00",
                Some(json!({ "now": raw })),
            )
        }),
        None => Ok(chrono::Local::now().naive_local()),
    }
}

fn parse_page(req: &Request) -> i64 {
    match req.params.get("page") {
        Some(v) => id_value(v)
            .or_else(|| v.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(1),
        None => 1,
    }
}

fn parse_window_param(req: &Request, key: &str) -> Result<NaiveDateTime, serde_json::Value> {
    let raw = required_str(req, key)?;
    calc::parse_datetime(&raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be a datetime like 2024-06-01T10:00", key),
            Some(json!({ "param": key, "value": raw })),
        )
    })
}

fn check_window(
    req: &Request,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<(), serde_json::Value> {
    if end < start {
        return Err(err(
            &req.id,
            "bad_params",
            "end must not be before start",
            Some(json!({
                "start": calc::format_datetime(start),
                "end": calc::format_datetime(end)
            })),
        ));
    }
    Ok(())
}

/// `None` when the request carries no `termIds`; duplicates collapse in order.
fn parse_term_ids(req: &Request) -> Result<Option<Vec<i64>>, serde_json::Value> {
    let Some(raw) = req.params.get("termIds") else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(Some(Vec::new()));
    }
    let Some(items) = raw.as_array() else {
        return Err(err(&req.id, "bad_params", "termIds must be an array", None));
    };
    let mut out: Vec<i64> = Vec::with_capacity(items.len());
    for item in items {
        let Some(id) = id_value(item) else {
            return Err(err(
                &req.id,
                "bad_params",
                "termIds must contain integer ids",
                Some(json!({ "value": item })),
            ));
        };
        if !out.contains(&id) {
            out.push(id);
        }
    }
    Ok(Some(out))
}

fn ensure_terms_exist(
    conn: &Connection,
    req: &Request,
    term_ids: &[i64],
) -> Result<(), serde_json::Value> {
    for &tid in term_ids {
        ensure_exists(conn, req, "terms", tid, "term")?;
    }
    Ok(())
}

fn load_exam(conn: &Connection, exam_id: i64) -> rusqlite::Result<Option<ExamRow>> {
    conn.query_row(
        "SELECT id, title, start_at, end_at, subject_id FROM exams WHERE id = ?",
        [exam_id],
        |r| {
            Ok(ExamRow {
                id: r.get(0)?,
                title: r.get(1)?,
                start: r.get(2)?,
                end: r.get(3)?,
                subject_id: r.get(4)?,
            })
        },
    )
    .optional()
}

fn load_exam_term_ids(conn: &Connection, exam_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt =
        conn.prepare("SELECT term_id FROM exam_terms WHERE exam_id = ? ORDER BY term_id")?;
    let ids = stmt
        .query_map([exam_id], |r| r.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

fn replace_exam_terms(
    tx: &rusqlite::Transaction<'_>,
    exam_id: i64,
    term_ids: &[i64],
) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM exam_terms WHERE exam_id = ?", [exam_id])?;
    for &tid in term_ids {
        tx.execute(
            "INSERT INTO exam_terms(exam_id, term_id) VALUES(?, ?)",
            (exam_id, tid),
        )?;
    }
    Ok(())
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let now = match parse_now(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let page = parse_page(req).max(1);
    let page_size = setup::exams_page_size(conn);
    let (offset, limit) = calc::page_window(page, page_size);

    let total: i64 = match conn.query_row("SELECT COUNT(*) FROM exams", [], |r| r.get(0)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Page in creation order first; the status ordering applies within the page.
    let mut stmt = match conn.prepare(
        "SELECT id, title, start_at, end_at, subject_id
         FROM exams
         ORDER BY id
         LIMIT ? OFFSET ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((limit, offset), |r| {
            Ok(ExamRow {
                id: r.get(0)?,
                title: r.get(1)?,
                start: r.get(2)?,
                end: r.get(3)?,
                subject_id: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut listed: Vec<(ExamRow, ExamStatus)> = rows
        .into_iter()
        .map(|row| {
            let status = exam_status(now, &row.start, &row.end);
            (row, status)
        })
        .collect();
    calc::sort_by_status(&mut listed, |(_, status)| *status);

    let exams: Vec<serde_json::Value> = listed
        .into_iter()
        .map(|(row, status)| {
            json!({
                "id": row.id,
                "title": row.title,
                "start": row.start,
                "end": row.end,
                "status": status.as_str()
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "exams": exams,
            "page": page,
            "pageSize": page_size,
            "total": total
        }),
    )
}

fn handle_exams_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let now = match parse_now(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exam = match load_exam(conn, exam_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "exam not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let term_ids = match load_exam_term_ids(conn, exam_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subject_name: Option<String> = match conn
        .query_row(
            "SELECT name FROM subjects WHERE id = ?",
            [exam.subject_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let status = exam_status(now, &exam.start, &exam.end);

    ok(
        &req.id,
        json!({
            "id": exam.id,
            "title": exam.title,
            "start": exam.start,
            "end": exam.end,
            "status": status.as_str(),
            "subjectId": exam.subject_id,
            "subjectName": subject_name,
            "termIds": term_ids
        }),
    )
}

fn handle_exams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start = match parse_window_param(req, "start") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end = match parse_window_param(req, "end") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = check_window(req, start, end) {
        return e;
    }
    let subject_id = match required_id(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "subjects", subject_id, "subject") {
        return e;
    }
    let term_ids = match parse_term_ids(req) {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => return e,
    };
    if let Err(e) = ensure_terms_exist(conn, req, &term_ids) {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO exams(title, start_at, end_at, subject_id) VALUES(?, ?, ?, ?)",
        (
            &title,
            calc::format_datetime(start),
            calc::format_datetime(end),
            subject_id,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exams" })),
        );
    }
    let exam_id = tx.last_insert_rowid();
    if let Err(e) = replace_exam_terms(&tx, exam_id, &term_ids) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exam_terms" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "examId": exam_id,
            "title": title,
            "start": calc::format_datetime(start),
            "end": calc::format_datetime(end),
            "subjectId": subject_id,
            "termIds": term_ids
        }),
    )
}

fn handle_exams_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current = match load_exam(conn, exam_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "exam not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let title = if req.params.get("title").is_some() {
        match required_str(req, "title") {
            Ok(v) => v,
            Err(e) => return e,
        }
    } else {
        current.title
    };
    let start = if req.params.get("start").is_some() {
        match parse_window_param(req, "start") {
            Ok(v) => v,
            Err(e) => return e,
        }
    } else {
        match calc::parse_datetime(&current.start) {
            Some(v) => v,
            None => return err(&req.id, "bad_params", "stored start is invalid; supply start", None),
        }
    };
    let end = if req.params.get("end").is_some() {
        match parse_window_param(req, "end") {
            Ok(v) => v,
            Err(e) => return e,
        }
    } else {
        match calc::parse_datetime(&current.end) {
            Some(v) => v,
            None => return err(&req.id, "bad_params", "stored end is invalid; supply end", None),
        }
    };
    if let Err(e) = check_window(req, start, end) {
        return e;
    }
    let subject_id = if req.params.get("subjectId").is_some() {
        match required_id(req, "subjectId") {
            Ok(v) => v,
            Err(e) => return e,
        }
    } else {
        current.subject_id
    };
    if let Err(e) = ensure_exists(conn, req, "subjects", subject_id, "subject") {
        return e;
    }
    let term_ids = match parse_term_ids(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(ids) = term_ids.as_deref() {
        if let Err(e) = ensure_terms_exist(conn, req, ids) {
            return e;
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE exams SET title = ?, start_at = ?, end_at = ?, subject_id = ? WHERE id = ?",
        (
            &title,
            calc::format_datetime(start),
            calc::format_datetime(end),
            subject_id,
            exam_id,
        ),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Some(ids) = term_ids.as_deref() {
        if let Err(e) = replace_exam_terms(&tx, exam_id, ids) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "exam_terms" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "examId": exam_id }))
}

fn handle_exams_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_id(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "exams", exam_id, "exam") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicit dependency order; the schema has no ON DELETE CASCADE.
    let steps: [(&str, &str); 4] = [
        (
            "result_marks",
            "DELETE FROM result_marks
             WHERE result_id IN (SELECT id FROM results WHERE exam_id = ?)",
        ),
        ("results", "DELETE FROM results WHERE exam_id = ?"),
        ("exam_terms", "DELETE FROM exam_terms WHERE exam_id = ?"),
        ("exams", "DELETE FROM exams WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [exam_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    log::info!("deleted exam {} with its results", exam_id);

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.list" => Some(handle_exams_list(state, req)),
        "exams.get" => Some(handle_exams_get(state, req)),
        "exams.create" => Some(handle_exams_create(state, req)),
        "exams.update" => Some(handle_exams_update(state, req)),
        "exams.delete" => Some(handle_exams_delete(state, req)),
        _ => None,
    }
}
