use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One stdin line: `{"id", "method", "params"}`. Missing params read as `null`.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Process-wide state. `db` is open exactly when a workspace is selected.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
