use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

pub const MARK_MIN: i64 = 0;
pub const MARK_MAX: i64 = 100;

/// One Result's marks in stored order: `(student_id, mark)`.
pub type MarkSheet = Vec<(i64, i64)>;

pub fn clamp_mark(raw: i64) -> i64 {
    raw.clamp(MARK_MIN, MARK_MAX)
}

/// Truncates toward zero before clamping; NaN and infinities land on the bounds
/// the same way `as i64` saturates.
pub fn mark_from_f64(v: f64) -> i64 {
    if v.is_nan() {
        return MARK_MIN;
    }
    clamp_mark(v.trunc() as i64)
}

/// Leading-integer parse used for typed-in and imported marks.
///
/// `" 85.7"` reads as 85, `"12abc"` as 12, `"abc"` as 0. The second value is
/// `true` when the text was not a clean number and had to be coerced.
pub fn parse_mark_lenient(raw: &str) -> (i64, bool) {
    let t = raw.trim();
    if let Ok(v) = t.parse::<i64>() {
        return (clamp_mark(v), false);
    }
    if let Ok(v) = t.parse::<f64>() {
        if v.is_finite() {
            return (mark_from_f64(v), false);
        }
    }

    let mut chars = t.chars().peekable();
    let mut negative = false;
    if let Some(&c) = chars.peek() {
        if c == '-' || c == '+' {
            negative = c == '-';
            chars.next();
        }
    }
    let mut value: i64 = 0;
    for c in chars {
        let Some(d) = c.to_digit(10) else {
            break;
        };
        value = value.saturating_mul(10).saturating_add(d as i64);
    }
    if negative {
        value = -value;
    }
    (clamp_mark(value), true)
}

/// Overwrite-by-key merge. Keys already present keep their position with the
/// incoming value; unseen keys are appended in incoming order.
pub fn merge_marks(existing: &[(i64, i64)], incoming: &[(i64, i64)]) -> MarkSheet {
    let mut out: MarkSheet = existing.to_vec();
    let mut index: HashMap<i64, usize> = out
        .iter()
        .enumerate()
        .map(|(i, (sid, _))| (*sid, i))
        .collect();
    for &(sid, mark) in incoming {
        match index.get(&sid) {
            Some(&i) => out[i].1 = mark,
            None => {
                index.insert(sid, out.len());
                out.push((sid, mark));
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderEntry {
    pub student_id: i64,
    pub total: i64,
}

/// Top `top` students by summed positive marks across the sheets of one term.
/// Marks <= 0 never open a student's tally; equal totals keep first-seen order.
pub fn term_leaderboard<'a, I>(sheets: I, top: usize) -> Vec<LeaderEntry>
where
    I: IntoIterator<Item = &'a MarkSheet>,
{
    let mut order: Vec<LeaderEntry> = Vec::new();
    let mut index: HashMap<i64, usize> = HashMap::new();

    for sheet in sheets {
        for &(student_id, mark) in sheet {
            if mark <= 0 {
                continue;
            }
            match index.get(&student_id) {
                Some(&i) => order[i].total += mark,
                None => {
                    index.insert(student_id, order.len());
                    order.push(LeaderEntry {
                        student_id,
                        total: mark,
                    });
                }
            }
        }
    }

    // sort_by is stable.
    order.sort_by(|a, b| b.total.cmp(&a.total));
    order.truncate(top);
    order
}

/// Sum of one student's marks over the sheets of one term; missing counts as 0.
pub fn student_term_total<'a, I>(sheets: I, student_id: i64) -> i64
where
    I: IntoIterator<Item = &'a MarkSheet>,
{
    sheets
        .into_iter()
        .flat_map(|s| s.iter())
        .filter(|(sid, _)| *sid == student_id)
        .map(|(_, mark)| *mark)
        .sum()
}

pub fn term_totals_by_student<'a, I>(sheets: I) -> HashMap<i64, i64>
where
    I: IntoIterator<Item = &'a MarkSheet>,
{
    let mut totals: HashMap<i64, i64> = HashMap::new();
    for sheet in sheets {
        for &(sid, mark) in sheet {
            *totals.entry(sid).or_insert(0) += mark;
        }
    }
    totals
}

/// Mean of the per-term totals, every term in the denominator. No terms => 0.
pub fn student_average(term_totals: &[i64], decimals: u32) -> f64 {
    if term_totals.is_empty() {
        return 0.0;
    }
    let sum: i64 = term_totals.iter().sum();
    round_to(sum as f64 / term_totals.len() as f64, decimals)
}

/// Half away from zero on the decimal value: the scaled number is first cut
/// to 15 significant digits, so 2.675 rounds to 2.68 and not to 2.67.
pub fn round_to(x: f64, decimals: u32) -> f64 {
    let f = 10f64.powi(decimals as i32);
    let scaled = x * f;
    let scaled = format!("{:.14e}", scaled).parse::<f64>().unwrap_or(scaled);
    scaled.round() / f
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamStatus {
    Current,
    Upcoming,
    Past,
}

impl ExamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExamStatus::Current => "current",
            ExamStatus::Upcoming => "upcoming",
            ExamStatus::Past => "past",
        }
    }

    fn rank(self) -> u8 {
        match self {
            ExamStatus::Current => 0,
            ExamStatus::Upcoming => 1,
            ExamStatus::Past => 2,
        }
    }
}

pub fn classify_exam(now: NaiveDateTime, start: NaiveDateTime, end: NaiveDateTime) -> ExamStatus {
    if start <= now && now <= end {
        ExamStatus::Current
    } else if now < start {
        ExamStatus::Upcoming
    } else {
        ExamStatus::Past
    }
}

/// Stable: current, then upcoming, then past, original order inside each bucket.
pub fn sort_by_status<T, F>(items: &mut [T], status: F)
where
    F: Fn(&T) -> ExamStatus,
{
    items.sort_by_key(|item| status(item).rank());
}

/// `(offset, limit)` for a 1-based page; pages below 1 read as page 1.
pub fn page_window(page: i64, page_size: i64) -> (i64, i64) {
    let page = page.max(1);
    let size = page_size.max(1);
    ((page - 1).saturating_mul(size), size)
}

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let t = raw.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(t, fmt).ok())
}

pub fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermSummary {
    pub id: i64,
    pub name: String,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub student_id: i64,
    pub student_name: String,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermLeaderboard {
    pub term_id: i64,
    pub term_name: String,
    pub start_date: String,
    pub entries: Vec<LeaderboardEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStatistics {
    pub student_id: i64,
    pub display_name: String,
    pub term_totals: Vec<i64>,
    pub average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsModel {
    pub terms: Vec<TermSummary>,
    pub rows: Vec<StudentStatistics>,
}

/// Terms newest first by start date; equal start dates fall back to id order.
pub fn load_terms(conn: &Connection) -> Result<Vec<TermSummary>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, start_date, end_date
             FROM terms
             ORDER BY start_date DESC, id",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(TermSummary {
                id: r.get(0)?,
                name: r.get(1)?,
                start_date: r.get(2)?,
                end_date: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows)
}

/// Mark sheets of every Result whose exam is tagged with `term_id`,
/// in Result id order with marks in stored order.
pub fn load_term_sheets(conn: &Connection, term_id: i64) -> Result<Vec<MarkSheet>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT r.id, m.student_id, m.mark
             FROM results r
             JOIN exam_terms et ON et.exam_id = r.exam_id
             LEFT JOIN result_marks m ON m.result_id = r.id
             WHERE et.term_id = ?
             ORDER BY r.id, m.rowid",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([term_id], |r| {
            let result_id: i64 = r.get(0)?;
            let student_id: Option<i64> = r.get(1)?;
            let mark: Option<i64> = r.get(2)?;
            Ok((result_id, student_id, mark))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut sheets: Vec<MarkSheet> = Vec::new();
    let mut current: Option<i64> = None;
    for (result_id, student_id, mark) in rows {
        if current != Some(result_id) {
            current = Some(result_id);
            sheets.push(Vec::new());
        }
        if let (Some(sid), Some(mark), Some(sheet)) = (student_id, mark, sheets.last_mut()) {
            sheet.push((sid, mark));
        }
    }
    Ok(sheets)
}

fn load_student_names(conn: &Connection) -> Result<Vec<(i64, String)>, CalcError> {
    let mut stmt = conn
        .prepare("SELECT id, display_name FROM students ORDER BY id")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(rows)
}

/// Per-term leaderboards, newest term first. Terms without a qualifying
/// positive mark are omitted.
pub fn compute_leaderboards(
    conn: &Connection,
    top: usize,
) -> Result<Vec<TermLeaderboard>, CalcError> {
    let names: HashMap<i64, String> = load_student_names(conn)?.into_iter().collect();
    let mut out: Vec<TermLeaderboard> = Vec::new();

    for term in load_terms(conn)? {
        let sheets = load_term_sheets(conn, term.id)?;
        if sheets.is_empty() {
            continue;
        }
        let entries: Vec<LeaderboardEntry> = term_leaderboard(&sheets, top)
            .into_iter()
            .filter_map(|e| {
                names.get(&e.student_id).map(|name| LeaderboardEntry {
                    student_id: e.student_id,
                    student_name: name.clone(),
                    total: e.total,
                })
            })
            .collect();
        if entries.is_empty() {
            continue;
        }
        out.push(TermLeaderboard {
            term_id: term.id,
            term_name: term.name,
            start_date: term.start_date,
            entries,
        });
    }

    Ok(out)
}

pub fn compute_student_term_total(
    conn: &Connection,
    student_id: i64,
    term_id: i64,
) -> Result<i64, CalcError> {
    let student: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if student.is_none() {
        return Err(CalcError::new("not_found", "student not found"));
    }
    let term: Option<i64> = conn
        .query_row("SELECT 1 FROM terms WHERE id = ?", [term_id], |r| r.get(0))
        .optional()
        .map_err(db_err)?;
    if term.is_none() {
        return Err(CalcError::new("not_found", "term not found"));
    }

    let sheets = load_term_sheets(conn, term_id)?;
    Ok(student_term_total(&sheets, student_id))
}

/// Student rows × term columns with a trailing average; all reads are done up
/// front and aggregated in memory.
pub fn compute_statistics(
    conn: &Connection,
    average_decimals: u32,
) -> Result<StatisticsModel, CalcError> {
    let terms = load_terms(conn)?;
    let mut per_term: Vec<HashMap<i64, i64>> = Vec::with_capacity(terms.len());
    for term in &terms {
        let sheets = load_term_sheets(conn, term.id)?;
        per_term.push(term_totals_by_student(&sheets));
    }

    let rows = load_student_names(conn)?
        .into_iter()
        .map(|(student_id, display_name)| {
            let term_totals: Vec<i64> = per_term
                .iter()
                .map(|totals| totals.get(&student_id).copied().unwrap_or(0))
                .collect();
            let average = student_average(&term_totals, average_decimals);
            StudentStatistics {
                student_id,
                display_name,
                term_totals,
                average,
            }
        })
        .collect();

    Ok(StatisticsModel { terms, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_parse_truncates_and_flags_coercion() {
        assert_eq!(parse_mark_lenient("70"), (70, false));
        assert_eq!(parse_mark_lenient(" 85.7 "), (85, false));
        assert_eq!(parse_mark_lenient("12abc"), (12, true));
        assert_eq!(parse_mark_lenient("abc"), (0, true));
        assert_eq!(parse_mark_lenient(""), (0, true));
        assert_eq!(parse_mark_lenient("-5"), (0, false));
        assert_eq!(parse_mark_lenient("250"), (100, false));
    }

    #[test]
    fn rounding_follows_the_decimal_value() {
        assert_eq!(round_to(2.675, 2), 2.68);
        assert_eq!(round_to(1.005, 2), 1.01);
        assert_eq!(round_to(-2.675, 2), -2.68);
        assert_eq!(round_to(40.0 / 3.0, 2), 13.33);
        assert_eq!(round_to(2.5, 0), 3.0);
    }

    #[test]
    fn page_window_clamps_low_pages() {
        assert_eq!(page_window(1, 10), (0, 10));
        assert_eq!(page_window(2, 10), (10, 10));
        assert_eq!(page_window(0, 10), (0, 10));
        assert_eq!(page_window(-3, 10), (0, 10));
    }

    #[test]
    fn parse_datetime_accepts_form_and_storage_shapes() {
        let a = parse_datetime("2024-06-01T10:00").expect("datetime-local");
        let b = parse_datetime("2024-06-01 10:00:00").expect("sql");
        assert_eq!(a, b);
        assert_eq!(format_datetime(a), "2024-06-01T10:00:00");
        assert!(parse_datetime("June 1st").is_none());
    }
}
