use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, ensure_exists, required_id, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.display_name,
           (SELECT COUNT(*) FROM result_marks m WHERE m.student_id = s.id) AS mark_count
         FROM students s
         ORDER BY s.id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: i64 = row.get(0)?;
            let display_name: String = row.get(1)?;
            let mark_count: i64 = row.get(2)?;
            Ok(json!({
                "id": id,
                "displayName": display_name,
                "markCount": mark_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let display_name = match required_str(req, "displayName") {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = conn.execute(
        "INSERT INTO students(display_name, created_at) VALUES(?, ?)",
        (&display_name, db::now_timestamp()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    let student_id = conn.last_insert_rowid();
    log::info!("created student {} ({})", student_id, display_name);

    ok(
        &req.id,
        json!({ "studentId": student_id, "displayName": display_name }),
    )
}

fn handle_students_rename(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let display_name = match required_str(req, "displayName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "students", student_id, "student") {
        return e;
    }

    if let Err(e) = conn.execute(
        "UPDATE students SET display_name = ? WHERE id = ?",
        (&display_name, student_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "displayName": display_name }),
    )
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_id(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "students", student_id, "student") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Marks go with the student; the Result records themselves stay.
    let removed_marks = match tx.execute(
        "DELETE FROM result_marks WHERE student_id = ?",
        [student_id],
    ) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "result_marks" })),
            );
        }
    };

    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    log::info!(
        "deleted student {} and {} mark(s)",
        student_id,
        removed_marks
    );

    ok(
        &req.id,
        json!({ "ok": true, "removedMarks": removed_marks }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.rename" => Some(handle_students_rename(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
