use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

/// Error envelope; `details` is left out entirely when `None`.
pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let message = message.into();
    log::debug!("request {} failed with {}: {}", id, code, message);
    let mut error = json!({
        "code": code,
        "message": message,
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Error envelope for an `anyhow` failure, message carrying the full context chain.
pub fn err_chain(
    id: &str,
    code: &str,
    e: &anyhow::Error,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    err(id, code, format!("{:#}", e), details)
}
