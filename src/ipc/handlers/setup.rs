use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::report::ReportOptions;
use serde_json::{json, Map, Value};

pub const DEFAULT_TOP_COUNT: i64 = 3;
pub const DEFAULT_PAGE_SIZE: i64 = 10;

#[derive(Clone, Copy)]
enum SetupSection {
    Leaderboard,
    Exams,
    Reports,
}

impl SetupSection {
    const ALL: [SetupSection; 3] = [Self::Leaderboard, Self::Exams, Self::Reports];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "leaderboard" => Some(Self::Leaderboard),
            "exams" => Some(Self::Exams),
            "reports" => Some(Self::Reports),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Leaderboard => "leaderboard",
            Self::Exams => "exams",
            Self::Reports => "reports",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Leaderboard => "setup.leaderboard",
            Self::Exams => "setup.exams",
            Self::Reports => "setup.reports",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Leaderboard => json!({
            "topCount": DEFAULT_TOP_COUNT
        }),
        SetupSection::Exams => json!({
            "pageSize": DEFAULT_PAGE_SIZE
        }),
        SetupSection::Reports => json!({
            "title": "Student Statistics Report",
            "termHeaderSuffix": " (Total)",
            "averageDecimals": 2
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Leaderboard => match k.as_str() {
                "topCount" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 20)?));
                }
                _ => return Err(format!("unknown leaderboard field: {}", k)),
            },
            SetupSection::Exams => match k.as_str() {
                "pageSize" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 100)?));
                }
                _ => return Err(format!("unknown exams field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "title" => {
                    let s = parse_string_max(v, k, 120)?;
                    if s.trim().is_empty() {
                        return Err("title must not be empty".into());
                    }
                    obj.insert(k.clone(), Value::String(s.trim().to_string()));
                }
                // Leading whitespace is meaningful here (" (Total)").
                "termHeaderSuffix" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 40)?));
                }
                "averageDecimals" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 4)?));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values fall back to defaults.
            if let Err(msg) = merge_section_patch(section, &mut current, saved_obj) {
                log::warn!("ignoring stored {} settings: {}", section.name(), msg);
                current = default_section(section);
            }
        }
    }
    Ok(current)
}

fn section_i64(conn: &rusqlite::Connection, section: SetupSection, field: &str, fallback: i64) -> i64 {
    match load_section(conn, section) {
        Ok(v) => v.get(field).and_then(|x| x.as_i64()).unwrap_or(fallback),
        Err(e) => {
            log::warn!("failed to load {} settings: {}", section.name(), e);
            fallback
        }
    }
}

pub fn leaderboard_top_count(conn: &rusqlite::Connection) -> usize {
    section_i64(conn, SetupSection::Leaderboard, "topCount", DEFAULT_TOP_COUNT).max(1) as usize
}

pub fn exams_page_size(conn: &rusqlite::Connection) -> i64 {
    section_i64(conn, SetupSection::Exams, "pageSize", DEFAULT_PAGE_SIZE).max(1)
}

pub fn report_options(conn: &rusqlite::Connection) -> ReportOptions {
    let defaults = ReportOptions::default();
    let section = match load_section(conn, SetupSection::Reports) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("failed to load reports settings: {}", e);
            return defaults;
        }
    };
    ReportOptions {
        title: section
            .get("title")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or(defaults.title),
        term_header_suffix: section
            .get("termHeaderSuffix")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or(defaults.term_header_suffix),
        average_decimals: section
            .get("averageDecimals")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
            .unwrap_or(defaults.average_decimals),
    }
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for section in SetupSection::ALL {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(
            &req.id,
            "bad_params",
            "unknown section",
            Some(json!({ "section": section_raw })),
        );
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    log::info!("updated {} settings", section.name());
    let mut out = Map::new();
    out.insert("ok".to_string(), Value::Bool(true));
    out.insert(section.name().to_string(), current);
    ok(&req.id, Value::Object(out))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
