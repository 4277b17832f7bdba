use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, ensure_exists, required_id, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;

fn parse_date_param(req: &Request, key: &str, raw: &str) -> Result<NaiveDate, serde_json::Value> {
    calc::parse_date(raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be a YYYY-MM-DD date", key),
            Some(json!({ "param": key, "value": raw })),
        )
    })
}

fn check_range(req: &Request, start: NaiveDate, end: NaiveDate) -> Result<(), serde_json::Value> {
    if end < start {
        return Err(err(
            &req.id,
            "bad_params",
            "endDate must not be before startDate",
            Some(json!({
                "startDate": start.to_string(),
                "endDate": end.to_string()
            })),
        ));
    }
    Ok(())
}

fn handle_terms_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "terms": [] }));
    };

    let terms = match calc::load_terms(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let mut count_stmt = match conn.prepare("SELECT COUNT(*) FROM exam_terms WHERE term_id = ?") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut out = Vec::with_capacity(terms.len());
    for t in terms {
        let exam_count: i64 = match count_stmt.query_row([t.id], |r| r.get(0)) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        out.push(json!({
            "id": t.id,
            "name": t.name,
            "startDate": t.start_date,
            "endDate": t.end_date,
            "examCount": exam_count
        }));
    }

    ok(&req.id, json!({ "terms": out }))
}

fn handle_terms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_raw = match required_str(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_raw = match required_str(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start = match parse_date_param(req, "startDate", &start_raw) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end = match parse_date_param(req, "endDate", &end_raw) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = check_range(req, start, end) {
        return e;
    }

    if let Err(e) = conn.execute(
        "INSERT INTO terms(name, start_date, end_date) VALUES(?, ?, ?)",
        (&name, start.to_string(), end.to_string()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "terms" })),
        );
    }

    ok(
        &req.id,
        json!({
            "termId": conn.last_insert_rowid(),
            "name": name,
            "startDate": start.to_string(),
            "endDate": end.to_string()
        }),
    )
}

fn handle_terms_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_id(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let current: Option<(String, String, String)> = match conn
        .query_row(
            "SELECT name, start_date, end_date FROM terms WHERE id = ?",
            [term_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((mut name, start_cur, end_cur)) = current else {
        return err(&req.id, "not_found", "term not found", None);
    };

    if req.params.get("name").is_some() {
        name = match required_str(req, "name") {
            Ok(v) => v,
            Err(e) => return e,
        };
    }
    let start_raw = req
        .params
        .get("startDate")
        .and_then(|v| v.as_str())
        .unwrap_or(start_cur.as_str())
        .to_string();
    let end_raw = req
        .params
        .get("endDate")
        .and_then(|v| v.as_str())
        .unwrap_or(end_cur.as_str())
        .to_string();
    let start = match parse_date_param(req, "startDate", &start_raw) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end = match parse_date_param(req, "endDate", &end_raw) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = check_range(req, start, end) {
        return e;
    }

    if let Err(e) = conn.execute(
        "UPDATE terms SET name = ?, start_date = ?, end_date = ? WHERE id = ?",
        (&name, start.to_string(), end.to_string(), term_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "termId": term_id,
            "name": name,
            "startDate": start.to_string(),
            "endDate": end.to_string()
        }),
    )
}

fn handle_terms_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_id(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "terms", term_id, "term") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM exam_terms WHERE term_id = ?", [term_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "exam_terms" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM terms WHERE id = ?", [term_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "terms" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "terms.list" => Some(handle_terms_list(state, req)),
        "terms.create" => Some(handle_terms_create(state, req)),
        "terms.update" => Some(handle_terms_update(state, req)),
        "terms.delete" => Some(handle_terms_delete(state, req)),
        _ => None,
    }
}
