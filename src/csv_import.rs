use anyhow::Context;
use sha2::{Digest, Sha256};

use crate::calc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvMarkRow {
    /// 1-based row number; the header is row 1.
    pub row: u64,
    pub student_id: i64,
    pub exam_id: i64,
    pub mark: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIssue {
    pub row: u64,
    pub message: String,
}

impl RowIssue {
    pub fn new(row: u64, message: impl Into<String>) -> Self {
        Self {
            row,
            message: message.into(),
        }
    }

    pub fn render(&self) -> String {
        format!("Row {}: {}", self.row, self.message)
    }
}

#[derive(Debug, Default)]
pub struct ParsedMarksCsv {
    pub rows: Vec<CsvMarkRow>,
    pub errors: Vec<RowIssue>,
    pub warnings: Vec<RowIssue>,
}

/// Id columns read like the mark column: leading integer, sign dropped.
/// Anything unreadable becomes 0, which never resolves to a record.
fn parse_id(raw: &str) -> i64 {
    let t = raw.trim();
    let t = t.strip_prefix('-').or_else(|| t.strip_prefix('+')).unwrap_or(t);
    let digits: String = t.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<i64>().unwrap_or(0)
}

fn is_line_end(b: &u8) -> bool {
    *b == b'\r' || *b == b'\n'
}

/// Counts line terminators (`\n`, `\r` or `\r\n`) in a run between records.
fn count_line_ends(gap: &[u8]) -> u64 {
    let mut n = 0;
    let mut i = 0;
    while i < gap.len() {
        if gap[i] == b'\r' && gap.get(i + 1) == Some(&b'\n') {
            i += 2;
        } else {
            i += 1;
        }
        n += 1;
    }
    n
}

/// Parses `student_id,exam_id,mark` rows. The first row is a header and is
/// skipped. Short rows and blank lines become errors; coerced marks become
/// warnings. Id resolution against the store happens in the caller.
///
/// Rows are numbered by record, so a quoted field spanning several lines
/// still counts as one row. Blank lines, which the reader skips, each take
/// a row number of their own.
pub fn parse_marks_csv(input: &[u8]) -> anyhow::Result<ParsedMarksCsv> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let mut out = ParsedMarksCsv::default();
    let mut record = csv::ByteRecord::new();
    let mut row: u64 = 0;
    let mut seen_record = false;
    // End of the previous record's content, before its terminator.
    let mut cursor: usize = 0;

    loop {
        let start = reader.position().byte() as usize;
        let more = reader
            .read_byte_record(&mut record)
            .with_context(|| format!("failed to read CSV row {}", row + 1))?;
        let end = if more {
            reader.position().byte() as usize
        } else {
            input.len()
        };
        let span = input.get(start..end).unwrap_or_default();
        let lead = span.iter().take_while(|b| is_line_end(b)).count();

        let mut blank = count_line_ends(input.get(cursor..start + lead).unwrap_or_default());
        if seen_record {
            // The first terminator closes the previous record.
            blank = blank.saturating_sub(1);
        }
        for _ in 0..blank {
            row += 1;
            if row > 1 {
                out.errors.push(RowIssue::new(row, "Invalid format"));
            }
        }
        if !more {
            break;
        }

        let trail = span[lead..].iter().rev().take_while(|b| is_line_end(b)).count();
        cursor = end - trail;
        seen_record = true;
        row += 1;
        if row == 1 {
            continue;
        }

        if record.len() < 3 {
            out.errors.push(RowIssue::new(row, "Invalid format"));
            continue;
        }

        let student_id = parse_id(&String::from_utf8_lossy(&record[0]));
        let exam_id = parse_id(&String::from_utf8_lossy(&record[1]));
        let raw_mark = String::from_utf8_lossy(&record[2]);
        let (mark, coerced) = calc::parse_mark_lenient(&raw_mark);
        if coerced {
            out.warnings.push(RowIssue::new(
                row,
                format!("Mark \"{}\" is not a number, stored as {}", raw_mark, mark),
            ));
        }

        out.rows.push(CsvMarkRow {
            row,
            student_id,
            exam_id,
            mark,
        });
    }

    Ok(out)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Groups accepted rows per exam, preserving first-seen order of exams and of
/// students inside each exam. Later rows overwrite earlier ones for the same pair.
pub fn group_by_exam(rows: &[CsvMarkRow]) -> Vec<(i64, calc::MarkSheet)> {
    let mut out: Vec<(i64, calc::MarkSheet)> = Vec::new();
    for r in rows {
        let pos = match out.iter().position(|(exam_id, _)| *exam_id == r.exam_id) {
            Some(p) => p,
            None => {
                out.push((r.exam_id, Vec::new()));
                out.len() - 1
            }
        };
        let sheet = &mut out[pos].1;
        *sheet = calc::merge_marks(sheet, &[(r.student_id, r.mark)]);
    }
    out
}

pub fn read_input_file(path: &std::path::Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_parse_follows_leading_digits() {
        assert_eq!(parse_id("12"), 12);
        assert_eq!(parse_id(" 7x"), 7);
        assert_eq!(parse_id("-3"), 3);
        assert_eq!(parse_id("abc"), 0);
    }

    #[test]
    fn line_ends_count_crlf_once() {
        assert_eq!(count_line_ends(b""), 0);
        assert_eq!(count_line_ends(b"\n"), 1);
        assert_eq!(count_line_ends(b"\r\n\r\n"), 2);
        assert_eq!(count_line_ends(b"\n\r\n\r"), 3);
    }

    #[test]
    fn sha256_hex_is_lowercase_64_chars() {
        let h = sha256_hex(b"student_id,exam_id,mark\n");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
