//! Text addressing: line/column positions, half-open ranges, occurrence
//! matching and the pure edit primitives built on them.
//!
//! Lines and columns are 1-indexed. Columns count Unicode scalar values.
//! A range `start..end` excludes `end`; `(L,1)..(L+1,1)` covers line `L`
//! including its line ending. Column `len + 1` addresses the position just
//! before the line ending, and `(line_count + 1, 1)` addresses end of file.

use std::ops::Range;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::errors::{MirrorError, MirrorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub col: usize,
}

impl Position {
    pub fn new(line: usize, col: usize) -> Self {
        Self { line, col }
    }
}

/// Matching rules shared by replace-text and delete-word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchOptions {
    pub case_sensitive: bool,
    pub whole_word: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            whole_word: false,
        }
    }
}

/// Which matches a replacement applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    /// 1-indexed
    Nth(usize),
    All,
}

impl Occurrence {
    /// `replace_all` wins; otherwise `occurrence` defaults to the first match.
    pub fn from_params(occurrence: Option<usize>, replace_all: bool) -> Self {
        if replace_all {
            Occurrence::All
        } else {
            Occurrence::Nth(occurrence.unwrap_or(1))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineOp {
    Replace,
    InsertBefore,
    InsertAfter,
    Delete,
}

#[derive(Debug, Clone, Copy)]
struct LineSpan {
    start: usize,
    /// Excludes the line ending
    content_end: usize,
    end: usize,
}

fn line_spans(text: &str) -> Vec<LineSpan> {
    let mut spans = Vec::new();
    let mut start = 0;
    for piece in text.split_inclusive('\n') {
        let end = start + piece.len();
        let content = piece
            .strip_suffix('\n')
            .map(|p| p.strip_suffix('\r').unwrap_or(p))
            .unwrap_or(piece);
        spans.push(LineSpan {
            start,
            content_end: start + content.len(),
            end,
        });
        start = end;
    }
    spans
}

pub fn line_count(text: &str) -> usize {
    text.split_inclusive('\n').count()
}

/// Dominant line ending of `text` (first one seen), `\n` when none.
pub fn detect_line_ending(text: &str) -> &'static str {
    match text.find('\n') {
        Some(idx) if idx > 0 && text.as_bytes()[idx - 1] == b'\r' => "\r\n",
        _ => "\n",
    }
}

fn normalize_newlines(text: &str, ending: &str) -> String {
    let unix = text.replace("\r\n", "\n");
    if ending == "\n" {
        unix
    } else {
        unix.replace('\n', ending)
    }
}

fn out_of_range(field: &str, reason: String) -> MirrorError {
    MirrorError::validation(field, reason)
}

/// Byte offset of a 1-indexed position.
pub fn offset_of(text: &str, pos: Position) -> MirrorResult<usize> {
    let spans = line_spans(text);
    offset_in(text, &spans, pos)
}

fn offset_in(text: &str, spans: &[LineSpan], pos: Position) -> MirrorResult<usize> {
    if pos.line == 0 || pos.col == 0 {
        return Err(out_of_range(
            "position",
            "lines and columns are 1-indexed".to_string(),
        ));
    }
    if pos.line == spans.len() + 1 {
        return if pos.col == 1 {
            Ok(text.len())
        } else {
            Err(out_of_range(
                "position",
                format!("line {} is past end of file", pos.line),
            ))
        };
    }
    let span = spans.get(pos.line - 1).ok_or_else(|| {
        out_of_range(
            "position",
            format!("line {} out of range (file has {} lines)", pos.line, spans.len()),
        )
    })?;
    let content = &text[span.start..span.content_end];
    let width = content.chars().count();
    if pos.col > width + 1 {
        return Err(out_of_range(
            "position",
            format!(
                "column {} out of range on line {} ({} characters)",
                pos.col, pos.line, width
            ),
        ));
    }
    let byte = content
        .char_indices()
        .nth(pos.col - 1)
        .map(|(i, _)| i)
        .unwrap_or(content.len());
    Ok(span.start + byte)
}

fn range_offsets(text: &str, start: Position, end: Position) -> MirrorResult<Range<usize>> {
    let spans = line_spans(text);
    let from = offset_in(text, &spans, start)?;
    let to = offset_in(text, &spans, end)?;
    if from > to {
        return Err(MirrorError::validation(
            "range",
            format!(
                "start {}:{} is after end {}:{}",
                start.line, start.col, end.line, end.col
            ),
        ));
    }
    Ok(from..to)
}

pub fn read_range(text: &str, start: Position, end: Position) -> MirrorResult<String> {
    let range = range_offsets(text, start, end)?;
    Ok(text[range].to_string())
}

/// Replace `start..end` with `replacement`.
pub fn edit_range(
    text: &str,
    start: Position,
    end: Position,
    replacement: &str,
) -> MirrorResult<String> {
    let range = range_offsets(text, start, end)?;
    let mut out = String::with_capacity(text.len() + replacement.len());
    out.push_str(&text[..range.start]);
    out.push_str(replacement);
    out.push_str(&text[range.end..]);
    Ok(out)
}

/// Where the end of `inserted` lands when written at `start`.
pub fn position_after(start: Position, inserted: &str) -> Position {
    match inserted.rfind('\n') {
        None => Position::new(start.line, start.col + inserted.chars().count()),
        Some(idx) => Position::new(
            start.line + inserted.matches('\n').count(),
            inserted[idx + 1..].chars().count() + 1,
        ),
    }
}

/// Delete `count` characters starting at `pos`.
pub fn delete_chars(text: &str, pos: Position, count: usize) -> MirrorResult<String> {
    if count == 0 {
        return Err(MirrorError::validation("count", "count must be at least 1"));
    }
    let from = offset_of(text, pos)?;
    let tail = &text[from..];
    let to = match tail.char_indices().nth(count) {
        Some((i, _)) => from + i,
        None if tail.chars().count() == count => text.len(),
        None => {
            return Err(MirrorError::validation(
                "count",
                format!(
                    "cannot delete {} characters at {}:{}; only {} remain",
                    count,
                    pos.line,
                    pos.col,
                    tail.chars().count()
                ),
            ))
        }
    };
    Ok(format!("{}{}", &text[..from], &text[to..]))
}

/// Delete lines `start_line..=end_line` including their endings.
pub fn delete_lines(text: &str, start_line: usize, end_line: usize) -> MirrorResult<String> {
    let spans = line_spans(text);
    if start_line == 0 || end_line < start_line || end_line > spans.len() {
        return Err(MirrorError::validation(
            "lines",
            format!(
                "invalid line range {}..={} (file has {} lines)",
                start_line,
                end_line,
                spans.len()
            ),
        ));
    }
    let from = spans[start_line - 1].start;
    let to = spans[end_line - 1].end;
    Ok(format!("{}{}", &text[..from], &text[to..]))
}

/// Single-line edit. Inserted and replacement text take the file's line
/// ending style; one trailing newline in `new_text` is ignored.
pub fn edit_line(text: &str, line: usize, op: LineOp, new_text: &str) -> MirrorResult<String> {
    let spans = line_spans(text);
    if line == 0 || line > spans.len() {
        return Err(MirrorError::validation(
            "line",
            format!("line {} out of range (file has {} lines)", line, spans.len()),
        ));
    }
    let span = spans[line - 1];
    let file_ending = detect_line_ending(text);
    let own_ending = &text[span.content_end..span.end];
    let trimmed = new_text
        .strip_suffix('\n')
        .map(|t| t.strip_suffix('\r').unwrap_or(t))
        .unwrap_or(new_text);
    let body = normalize_newlines(trimmed, file_ending);

    let (head, tail) = (&text[..span.start], &text[span.end..]);
    let current = &text[span.start..span.end];
    let out = match op {
        LineOp::Replace => format!("{}{}{}{}", head, body, own_ending, tail),
        LineOp::InsertBefore => format!("{}{}{}{}{}", head, body, file_ending, current, tail),
        LineOp::InsertAfter if own_ending.is_empty() => {
            format!("{}{}{}{}", head, current, file_ending, body)
        }
        LineOp::InsertAfter => format!("{}{}{}{}{}", head, current, body, file_ending, tail),
        LineOp::Delete => format!("{}{}", head, tail),
    };
    Ok(out)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn word_bounded(text: &str, range: &Range<usize>) -> bool {
    let before = text[..range.start].chars().next_back();
    let after = text[range.end..].chars().next();
    !before.map(is_word_char).unwrap_or(false) && !after.map(is_word_char).unwrap_or(false)
}

/// Byte ranges of non-overlapping literal matches of `needle`.
///
/// Case folding applies while locating candidates; the whole-word filter
/// then discards candidates, and a rejected candidate only advances the
/// scan by one character so an overlapping bounded match is still found.
/// Occurrence numbers refer to the surviving matches.
pub fn find_occurrences(
    text: &str,
    needle: &str,
    options: MatchOptions,
) -> MirrorResult<Vec<Range<usize>>> {
    if needle.is_empty() {
        return Err(MirrorError::validation("old", "search text cannot be empty"));
    }
    let re = RegexBuilder::new(&regex::escape(needle))
        .case_insensitive(!options.case_sensitive)
        .build()
        .map_err(|e| MirrorError::validation("old", e.to_string()))?;

    let mut found = Vec::new();
    let mut at = 0;
    while at <= text.len() {
        let Some(m) = re.find_at(text, at) else {
            break;
        };
        let range = m.range();
        if !options.whole_word || word_bounded(text, &range) {
            at = range.end;
            found.push(range);
        } else {
            let step = text[range.start..]
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(1);
            at = range.start + step;
        }
    }
    Ok(found)
}

/// Replace the selected matches of `old`. Returns the new text and how many
/// matches were replaced.
pub fn replace_text(
    text: &str,
    old: &str,
    new: &str,
    which: Occurrence,
    options: MatchOptions,
) -> MirrorResult<(String, usize)> {
    let matches = find_occurrences(text, old, options)?;
    let selected: Vec<Range<usize>> = match which {
        Occurrence::All => {
            if matches.is_empty() {
                return Err(MirrorError::validation(
                    "old",
                    format!("'{}' not found", old),
                ));
            }
            matches
        }
        Occurrence::Nth(0) => {
            return Err(MirrorError::validation(
                "occurrence",
                "occurrence is 1-indexed",
            ))
        }
        Occurrence::Nth(n) => match matches.get(n - 1) {
            Some(range) => vec![range.clone()],
            None => {
                return Err(MirrorError::validation(
                    "occurrence",
                    format!(
                        "occurrence {} requested but '{}' occurs {} time(s)",
                        n,
                        old,
                        matches.len()
                    ),
                ))
            }
        },
    };

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for range in &selected {
        out.push_str(&text[last..range.start]);
        out.push_str(new);
        last = range.end;
    }
    out.push_str(&text[last..]);
    Ok((out, selected.len()))
}

/// Zero-length replacement with the same matching rules as [`replace_text`].
pub fn delete_word(
    text: &str,
    word: &str,
    which: Occurrence,
    options: MatchOptions,
) -> MirrorResult<(String, usize)> {
    replace_text(text, word, "", which, options)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NumberedLine {
    pub number: usize,
    pub text: String,
}

/// One page of a file.
#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub start_line: usize,
    pub end_line: usize,
    pub total_lines: usize,
    pub lines: Vec<NumberedLine>,
    /// `None` once the last line has been returned
    pub next_start_line: Option<usize>,
}

pub fn read_sections(text: &str, start_line: usize, max_lines: usize) -> MirrorResult<Section> {
    if start_line == 0 || max_lines == 0 {
        return Err(MirrorError::validation(
            "start_line",
            "start_line and max_lines must be at least 1",
        ));
    }
    let spans = line_spans(text);
    let total = spans.len();
    if start_line > total.max(1) {
        return Err(MirrorError::validation(
            "start_line",
            format!("start_line {} past end of file ({} lines)", start_line, total),
        ));
    }
    let lines: Vec<NumberedLine> = spans
        .iter()
        .enumerate()
        .skip(start_line - 1)
        .take(max_lines)
        .map(|(i, span)| NumberedLine {
            number: i + 1,
            text: text[span.start..span.content_end].to_string(),
        })
        .collect();
    let end_line = lines.last().map(|l| l.number).unwrap_or(start_line - 1);
    Ok(Section {
        start_line,
        end_line,
        total_lines: total,
        next_start_line: (end_line < total).then_some(end_line + 1),
        lines,
    })
}
