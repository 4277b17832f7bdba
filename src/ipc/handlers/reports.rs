use crate::calc;
use crate::ipc::error::{err, err_chain, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{calc_err, db_conn, required_id};
use crate::ipc::types::{AppState, Request};
use crate::report::{self, ExportFormat};
use serde_json::json;
use std::path::PathBuf;

fn handle_leaderboard_terms(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let top = match req.params.get("top") {
        None | Some(serde_json::Value::Null) => setup::leaderboard_top_count(conn),
        Some(v) => match v.as_u64() {
            Some(n) if (1..=20).contains(&n) => n as usize,
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "top must be an integer in 1..=20",
                    Some(json!({ "top": v })),
                )
            }
        },
    };

    let boards = match calc::compute_leaderboards(conn, top) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    match serde_json::to_value(&boards) {
        Ok(terms) => ok(&req.id, json!({ "topCount": top, "terms": terms })),
        Err(e) => err(&req.id, "server_error", e.to_string(), None),
    }
}

fn handle_reports_student_term_total(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_id(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match calc::compute_student_term_total(conn, student_id, term_id) {
        Ok(total) => ok(
            &req.id,
            json!({ "studentId": student_id, "termId": term_id, "total": total }),
        ),
        Err(e) => calc_err(req, e),
    }
}

fn handle_reports_statistics_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let opts = setup::report_options(conn);
    let model = match calc::compute_statistics(conn, opts.average_decimals) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let table = report::statistics_table(&model, &opts);

    let model_json = match serde_json::to_value(&model) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "server_error", e.to_string(), None),
    };
    let table_json = match serde_json::to_value(&table) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "server_error", e.to_string(), None),
    };
    ok(&req.id, json!({ "model": model_json, "table": table_json }))
}

fn handle_reports_statistics_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let format_raw = req
        .params
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("csv");
    let Some(format) = ExportFormat::parse(format_raw) else {
        return err(
            &req.id,
            "bad_params",
            "format must be csv or html",
            Some(json!({ "format": format_raw })),
        );
    };

    let opts = setup::report_options(conn);
    let model = match calc::compute_statistics(conn, opts.average_decimals) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let table = report::statistics_table(&model, &opts);

    match report::write_report(&table, format, &PathBuf::from(&out_path)) {
        Ok(bytes) => {
            log::info!(
                "wrote {} statistics report ({} rows) to {}",
                format.as_str(),
                table.rows.len(),
                out_path
            );
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "path": out_path,
                    "format": format.as_str(),
                    "rowCount": table.rows.len(),
                    "bytesWritten": bytes
                }),
            )
        }
        Err(e) => err_chain(
            &req.id,
            "io_failed",
            &e,
            Some(json!({ "path": out_path })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "leaderboard.terms" => Some(handle_leaderboard_terms(state, req)),
        "reports.studentTermTotal" => Some(handle_reports_student_term_total(state, req)),
        "reports.statisticsModel" => Some(handle_reports_statistics_model(state, req)),
        "reports.statisticsExport" => Some(handle_reports_statistics_export(state, req)),
        _ => None,
    }
}
