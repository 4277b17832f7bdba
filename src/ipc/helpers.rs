use crate::calc;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) => {
            let t = v.trim();
            if t.is_empty() {
                Err(err(
                    &req.id,
                    "bad_params",
                    format!("{} must not be empty", key),
                    None,
                ))
            } else {
                Ok(t.to_string())
            }
        }
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

/// Ids arrive as JSON numbers or numeric strings.
pub fn id_value(v: &serde_json::Value) -> Option<i64> {
    match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

pub fn required_id(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    let Some(raw) = req.params.get(key) else {
        return Err(err(&req.id, "bad_params", format!("missing {}", key), None));
    };
    id_value(raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be an integer id", key),
            Some(json!({ "param": key, "value": raw })),
        )
    })
}

pub fn optional_id(req: &Request, key: &str) -> Result<Option<i64>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(_) => required_id(req, key).map(Some),
    }
}

pub fn calc_err(req: &Request, e: calc::CalcError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

/// `Ok(true)` when a row with this id exists in `table`.
pub fn row_exists(conn: &Connection, table: &str, id: i64) -> rusqlite::Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found: Option<i64> = conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
    Ok(found.is_some())
}

pub fn ensure_exists(
    conn: &Connection,
    req: &Request,
    table: &str,
    id: i64,
    what: &str,
) -> Result<(), serde_json::Value> {
    match row_exists(conn, table, id) {
        Ok(true) => Ok(()),
        Ok(false) => Err(err(
            &req.id,
            "not_found",
            format!("{} not found", what),
            Some(json!({ "id": id })),
        )),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}
