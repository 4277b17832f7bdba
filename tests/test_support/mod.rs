#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_examd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn examd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Returns the error code of a request that must fail.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Fixed ids for a small seeded workspace.
pub struct Seeded {
    pub students: Vec<i64>,
    pub subject_id: i64,
    pub term_id: i64,
}

pub fn id_of(v: &serde_json::Value, key: &str) -> i64 {
    v.get(key)
        .and_then(|x| x.as_i64())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
}

/// Creates `names` as students, one subject and one term.
pub fn seed_basics(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    names: &[&str],
) -> Seeded {
    let mut students = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let res = request_ok(
            stdin,
            reader,
            &format!("seed-s{}", i),
            "students.create",
            json!({ "displayName": name }),
        );
        students.push(id_of(&res, "studentId"));
    }
    let subject = request_ok(
        stdin,
        reader,
        "seed-subject",
        "subjects.create",
        json!({ "name": "Mathematics" }),
    );
    let term = request_ok(
        stdin,
        reader,
        "seed-term",
        "terms.create",
        json!({ "name": "Term 1", "startDate": "2024-01-08", "endDate": "2024-04-05" }),
    );
    Seeded {
        students,
        subject_id: id_of(&subject, "subjectId"),
        term_id: id_of(&term, "termId"),
    }
}

pub fn create_exam(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    title: &str,
    subject_id: i64,
    term_ids: &[i64],
) -> i64 {
    let res = request_ok(
        stdin,
        reader,
        id,
        "exams.create",
        json!({
            "title": title,
            "start": "2024-02-01T09:00:00",
            "end": "2024-02-01T11:00:00",
            "subjectId": subject_id,
            "termIds": term_ids
        }),
    );
    id_of(&res, "examId")
}
